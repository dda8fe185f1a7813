//! Per-task cost ledger.

use std::sync::Arc;

use uuid::Uuid;

use taskpilot_core::error::TaskPilotError;
use taskpilot_core::types::{ActionKind, CostEntry, Timestamp, Usage};

use crate::db::{storage_err, Database};
use crate::tasks::parse_uuid;

pub struct CostLedger {
    db: Arc<Database>,
}

impl CostLedger {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn record(&self, entry: &CostEntry) -> Result<(), TaskPilotError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO cost_ledger (task_id, plan_id, step_index, action, tokens,
                     duration_secs, units, cost, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    entry.task_id.to_string(),
                    entry.plan_id.to_string(),
                    entry.step_index as i64,
                    entry.action.as_str(),
                    entry.usage.tokens as i64,
                    entry.usage.duration_secs,
                    entry.usage.units,
                    entry.cost,
                    entry.recorded_at.0,
                ],
            )
            .map_err(|e| TaskPilotError::Storage(format!("Failed to record cost: {}", e)))?;
            Ok(())
        })
    }

    pub fn entries(&self, task_id: Uuid) -> Result<Vec<CostEntry>, TaskPilotError> {
        let rows = self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT task_id, plan_id, step_index, action, tokens, duration_secs, units,
                            cost, recorded_at
                     FROM cost_ledger WHERE task_id = ?1 ORDER BY id ASC",
                )
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(rusqlite::params![task_id.to_string()], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, f64>(5)?,
                        row.get::<_, f64>(6)?,
                        row.get::<_, f64>(7)?,
                        row.get::<_, i64>(8)?,
                    ))
                })
                .map_err(storage_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(storage_err)?;
            Ok(rows)
        })?;

        rows.into_iter()
            .map(
                |(task_id, plan_id, step_index, action, tokens, duration_secs, units, cost, at)| {
                    Ok(CostEntry {
                        task_id: parse_uuid(&task_id)?,
                        plan_id: parse_uuid(&plan_id)?,
                        step_index: step_index as usize,
                        action: action
                            .parse::<ActionKind>()
                            .map_err(|e| TaskPilotError::Corrupt(e.to_string()))?,
                        usage: Usage {
                            tokens: tokens.max(0) as u64,
                            duration_secs,
                            units,
                        },
                        cost,
                        recorded_at: Timestamp(at),
                    })
                },
            )
            .collect()
    }

    /// Sum of all recorded costs for a task.
    pub fn total(&self, task_id: Uuid) -> Result<f64, TaskPilotError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT COALESCE(SUM(cost), 0.0) FROM cost_ledger WHERE task_id = ?1",
                rusqlite::params![task_id.to_string()],
                |row| row.get(0),
            )
            .map_err(storage_err)
        })
    }
}
