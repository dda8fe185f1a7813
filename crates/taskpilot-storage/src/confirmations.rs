//! Durable user confirmations for gated plan steps.

use std::sync::Arc;

use uuid::Uuid;

use taskpilot_core::error::TaskPilotError;
use taskpilot_core::types::{ActionKind, Confirmation, ConfirmationStatus, Timestamp};

use crate::db::{storage_err, Database, OptionalExt};
use crate::tasks::parse_uuid;

const COLUMNS: &str =
    "id, task_id, plan_id, step_index, action, description, status, requested_at, decided_at";

pub struct ConfirmationRepository {
    db: Arc<Database>,
}

impl ConfirmationRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn create(&self, confirmation: &Confirmation) -> Result<(), TaskPilotError> {
        self.db.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO confirmations ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    COLUMNS
                ),
                rusqlite::params![
                    confirmation.id.to_string(),
                    confirmation.task_id.to_string(),
                    confirmation.plan_id.to_string(),
                    confirmation.step_index as i64,
                    confirmation.action.as_str(),
                    confirmation.description,
                    confirmation.status.as_str(),
                    confirmation.requested_at.0,
                    confirmation.decided_at.map(|t| t.0),
                ],
            )
            .map_err(|e| TaskPilotError::Storage(format!("Failed to create confirmation: {}", e)))?;
            Ok(())
        })
    }

    pub fn find(&self, id: Uuid) -> Result<Option<Confirmation>, TaskPilotError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM confirmations WHERE id = ?1", COLUMNS),
                rusqlite::params![id.to_string()],
                |row| Ok(row_to_confirmation(row)),
            )
            .optional()
            .map_err(storage_err)?
            .transpose()
        })
    }

    /// The most recent confirmation requested for a step of a plan version.
    pub fn find_for_step(
        &self,
        plan_id: Uuid,
        step_index: usize,
    ) -> Result<Option<Confirmation>, TaskPilotError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM confirmations WHERE plan_id = ?1 AND step_index = ?2
                     ORDER BY requested_at DESC, rowid DESC LIMIT 1",
                    COLUMNS
                ),
                rusqlite::params![plan_id.to_string(), step_index as i64],
                |row| Ok(row_to_confirmation(row)),
            )
            .optional()
            .map_err(storage_err)?
            .transpose()
        })
    }

    /// Record a decision on a pending confirmation.
    ///
    /// Fails with `Conflict` if the confirmation was already decided.
    pub fn decide(
        &self,
        id: Uuid,
        status: ConfirmationStatus,
    ) -> Result<Confirmation, TaskPilotError> {
        if status == ConfirmationStatus::Pending {
            return Err(TaskPilotError::InvalidInput(
                "A decision cannot be pending".into(),
            ));
        }
        let affected = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE confirmations SET status = ?1, decided_at = ?2
                 WHERE id = ?3 AND status = 'pending'",
                rusqlite::params![status.as_str(), Timestamp::now().0, id.to_string()],
            )
            .map_err(storage_err)
        })?;

        let confirmation = self
            .find(id)?
            .ok_or_else(|| TaskPilotError::NotFound(format!("Confirmation {}", id)))?;
        if affected == 0 {
            return Err(TaskPilotError::Conflict(format!(
                "Confirmation {} is already {}",
                id, confirmation.status
            )));
        }
        Ok(confirmation)
    }

    /// Mark pending confirmations older than `timeout_secs` as expired.
    /// Returns the number of rows changed.
    pub fn expire_stale(&self, timeout_secs: u64) -> Result<usize, TaskPilotError> {
        let now = Timestamp::now().0;
        let cutoff = now - timeout_secs as i64;
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE confirmations SET status = 'expired', decided_at = ?1
                 WHERE status = 'pending' AND requested_at <= ?2",
                rusqlite::params![now, cutoff],
            )
            .map_err(storage_err)
        })
    }
}

fn row_to_confirmation(row: &rusqlite::Row<'_>) -> Result<Confirmation, TaskPilotError> {
    let get_err = |e: rusqlite::Error| TaskPilotError::Storage(e.to_string());
    let id: String = row.get(0).map_err(get_err)?;
    let task_id: String = row.get(1).map_err(get_err)?;
    let plan_id: String = row.get(2).map_err(get_err)?;
    let step_index: i64 = row.get(3).map_err(get_err)?;
    let action: String = row.get(4).map_err(get_err)?;
    let status: String = row.get(6).map_err(get_err)?;

    Ok(Confirmation {
        id: parse_uuid(&id)?,
        task_id: parse_uuid(&task_id)?,
        plan_id: parse_uuid(&plan_id)?,
        step_index: step_index as usize,
        action: action
            .parse::<ActionKind>()
            .map_err(|e| TaskPilotError::Corrupt(e.to_string()))?,
        description: row.get(5).map_err(get_err)?,
        status: status
            .parse()
            .map_err(|e: TaskPilotError| TaskPilotError::Corrupt(e.to_string()))?,
        requested_at: Timestamp(row.get(7).map_err(get_err)?),
        decided_at: row.get::<_, Option<i64>>(8).map_err(get_err)?.map(Timestamp),
    })
}
