//! Task, plan and task-log persistence.
//!
//! State changes go through [`TaskRepository::commit_transition`], which
//! appends the `state_transition` log entry and then updates the task row
//! inside one transaction. The log is authoritative: [`TaskRepository::recover`]
//! realigns a task whose stored state disagrees with its last logged
//! transition.

use std::sync::Arc;

use rusqlite::Connection;
use serde_json::{json, Value};
use uuid::Uuid;

use taskpilot_core::error::TaskPilotError;
use taskpilot_core::sensitive::redact_value;
use taskpilot_core::types::{
    LogEntry, LogEvent, MonitorState, Plan, PlanStep, Suspension, Task, TaskFilter,
    TaskPriority, TaskState, Timestamp,
};

use crate::db::{storage_err, Database, OptionalExt};

const TASK_COLUMNS: &str = "id, user_id, goal, state, priority, active_plan_id, metadata, \
                            monitor, suspension, created_at, updated_at, archived_at";

const PLAN_COLUMNS: &str =
    "id, task_id, version, intent, intent_confidence, reason, steps, created_at, superseded_at";

/// Repository for tasks, their plan versions and their append-only log.
pub struct TaskRepository {
    db: Arc<Database>,
}

impl TaskRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new task together with its `task_created` log entry.
    pub fn create(&self, task: &Task) -> Result<(), TaskPilotError> {
        self.db.with_transaction(|tx| {
            tx.execute(
                &format!(
                    "INSERT INTO tasks ({}) VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, ?7, ?8, ?9, ?10, NULL)",
                    TASK_COLUMNS
                ),
                rusqlite::params![
                    task.id.to_string(),
                    task.user_id.to_string(),
                    task.goal,
                    task.state.as_str(),
                    task.priority.as_str(),
                    task.metadata.to_string(),
                    serde_json::to_string(&task.monitor)?,
                    task.suspension
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    task.created_at.0,
                    task.updated_at.0,
                ],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    TaskPilotError::NotFound(format!("User {}", task.user_id))
                }
                other => TaskPilotError::Storage(format!("Failed to create task: {}", other)),
            })?;

            insert_log(
                tx,
                task.id,
                LogEvent::TaskCreated,
                &json!({
                    "user_id": task.user_id,
                    "goal": task.goal,
                    "priority": task.priority,
                    "metadata": task.metadata,
                }),
            )?;
            Ok(())
        })
    }

    /// Load a task with its active plan.
    pub fn find_by_id(&self, id: Uuid) -> Result<Option<Task>, TaskPilotError> {
        self.db.with_conn(|conn| load_task(conn, id))
    }

    /// Load a task or fail with `NotFound`.
    pub fn get(&self, id: Uuid) -> Result<Task, TaskPilotError> {
        self.find_by_id(id)?
            .ok_or_else(|| TaskPilotError::NotFound(format!("Task {}", id)))
    }

    /// List tasks, newest first.
    pub fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, TaskPilotError> {
        self.db.with_conn(|conn| {
            let mut sql = "SELECT id FROM tasks WHERE 1 = 1".to_string();
            let mut params: Vec<String> = Vec::new();
            if let Some(user_id) = filter.user_id {
                params.push(user_id.to_string());
                sql.push_str(&format!(" AND user_id = ?{}", params.len()));
            }
            if let Some(state) = filter.state {
                params.push(state.as_str().to_string());
                sql.push_str(&format!(" AND state = ?{}", params.len()));
            }
            if let Some(priority) = filter.priority {
                params.push(priority.as_str().to_string());
                sql.push_str(&format!(" AND priority = ?{}", params.len()));
            }
            sql.push_str(" ORDER BY created_at DESC, rowid DESC");
            let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
            sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, filter.skip));

            let mut stmt = conn.prepare(&sql).map_err(storage_err)?;
            let ids: Vec<String> = stmt
                .query_map(rusqlite::params_from_iter(params.iter()), |row| row.get(0))
                .map_err(storage_err)?
                .collect::<Result<_, _>>()
                .map_err(storage_err)?;

            let mut tasks = Vec::with_capacity(ids.len());
            for id in ids {
                let id = parse_uuid(&id)?;
                if let Some(task) = load_task(conn, id)? {
                    tasks.push(task);
                }
            }
            Ok(tasks)
        })
    }

    /// Tasks not yet archived, oldest first. Terminal tasks are archived by
    /// the transition that ends them, so this is the recovery working set.
    pub fn unfinished(&self) -> Result<Vec<Task>, TaskPilotError> {
        self.load_open("")
    }

    /// Unfinished tasks parked on a confirmation or on input, oldest first.
    pub fn suspended(&self) -> Result<Vec<Task>, TaskPilotError> {
        self.load_open(" AND suspension IS NOT NULL")
    }

    fn load_open(&self, extra: &str) -> Result<Vec<Task>, TaskPilotError> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT id FROM tasks WHERE archived_at IS NULL{} ORDER BY created_at, rowid",
                extra
            );
            let mut stmt = conn.prepare(&sql).map_err(storage_err)?;
            let ids: Vec<String> = stmt
                .query_map([], |row| row.get(0))
                .map_err(storage_err)?
                .collect::<Result<_, _>>()
                .map_err(storage_err)?;

            let mut tasks = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(task) = load_task(conn, parse_uuid(&id)?)? {
                    tasks.push(task);
                }
            }
            Ok(tasks)
        })
    }

    /// Persist non-state fields: metadata, monitor counters, suspension and
    /// the step statuses of the active plan.
    ///
    /// The task state column is never touched here.
    pub fn save(&self, task: &Task) -> Result<(), TaskPilotError> {
        self.db.with_transaction(|tx| write_mutable_fields(tx, task))
    }

    /// Append a `state_transition` entry, then move the task from `from` to
    /// `task.state` and persist its other fields.
    ///
    /// Fails with `Conflict` if the stored state is no longer `from`.
    pub fn commit_transition(
        &self,
        task: &Task,
        from: TaskState,
        trigger: &str,
        detail: Value,
    ) -> Result<LogEntry, TaskPilotError> {
        self.db.with_transaction(|tx| {
            let entry = insert_log(
                tx,
                task.id,
                LogEvent::StateTransition,
                &json!({
                    "from": from,
                    "to": task.state,
                    "trigger": trigger,
                    "detail": detail,
                }),
            )?;

            let archived_at = if task.state.is_terminal() {
                Some(Timestamp::now().0)
            } else {
                None
            };
            let affected = tx
                .execute(
                    "UPDATE tasks SET state = ?1, archived_at = COALESCE(archived_at, ?2)
                     WHERE id = ?3 AND state = ?4",
                    rusqlite::params![
                        task.state.as_str(),
                        archived_at,
                        task.id.to_string(),
                        from.as_str(),
                    ],
                )
                .map_err(storage_err)?;
            if affected != 1 {
                return Err(TaskPilotError::Conflict(format!(
                    "Task {} is no longer in state {}",
                    task.id, from
                )));
            }

            write_mutable_fields(tx, task)?;
            Ok(entry)
        })
    }

    /// Install a new plan version as the task's active plan.
    ///
    /// The previous active plan, if any, is marked superseded. Its rows are
    /// kept for audit and never mutated again.
    pub fn install_plan(&self, plan: &Plan) -> Result<(), TaskPilotError> {
        self.db.with_transaction(|tx| {
            let previous: Option<Option<String>> = tx
                .query_row(
                    "SELECT active_plan_id FROM tasks WHERE id = ?1",
                    rusqlite::params![plan.task_id.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(storage_err)?;
            let previous = match previous {
                Some(previous) => previous,
                None => return Err(TaskPilotError::NotFound(format!("Task {}", plan.task_id))),
            };

            let now = Timestamp::now().0;
            if let Some(previous_id) = &previous {
                tx.execute(
                    "UPDATE plans SET superseded_at = ?1 WHERE id = ?2",
                    rusqlite::params![now, previous_id],
                )
                .map_err(storage_err)?;
                insert_log(
                    tx,
                    plan.task_id,
                    LogEvent::PlanSuperseded,
                    &json!({"plan_id": previous_id, "superseded_by": plan.id}),
                )?;
            }

            tx.execute(
                &format!(
                    "INSERT INTO plans ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL)",
                    PLAN_COLUMNS
                ),
                rusqlite::params![
                    plan.id.to_string(),
                    plan.task_id.to_string(),
                    plan.version,
                    plan.intent,
                    plan.intent_confidence,
                    plan.reason,
                    serde_json::to_string(&plan.steps)?,
                    plan.created_at.0,
                ],
            )
            .map_err(|e| TaskPilotError::Storage(format!("Failed to insert plan: {}", e)))?;

            tx.execute(
                "UPDATE tasks SET active_plan_id = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![plan.id.to_string(), now, plan.task_id.to_string()],
            )
            .map_err(storage_err)?;

            let steps: Vec<Value> = plan
                .steps
                .iter()
                .map(|s| {
                    json!({
                        "index": s.index,
                        "subtask": s.subtask,
                        "phase": s.phase,
                        "action": s.action,
                        "confidence": s.confidence,
                    })
                })
                .collect();
            insert_log(
                tx,
                plan.task_id,
                LogEvent::PlanCreated,
                &json!({
                    "plan_id": plan.id,
                    "version": plan.version,
                    "intent": plan.intent,
                    "intent_confidence": plan.intent_confidence,
                    "reason": plan.reason,
                    "steps": steps,
                }),
            )?;
            Ok(())
        })
    }

    /// Every plan version of a task, oldest first.
    pub fn plans(&self, task_id: Uuid) -> Result<Vec<Plan>, TaskPilotError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM plans WHERE task_id = ?1 ORDER BY version ASC",
                    PLAN_COLUMNS
                ))
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(rusqlite::params![task_id.to_string()], |row| Ok(row_to_plan(row)))
                .map_err(storage_err)?;
            let mut plans = Vec::new();
            for row in rows {
                plans.push(row.map_err(storage_err)??);
            }
            Ok(plans)
        })
    }

    /// Append one entry to the task log. The payload is redacted first.
    pub fn append_log(
        &self,
        task_id: Uuid,
        event: LogEvent,
        payload: Value,
    ) -> Result<LogEntry, TaskPilotError> {
        self.db
            .with_transaction(|tx| insert_log(tx, task_id, event, &payload))
    }

    /// The full log of a task in sequence order.
    pub fn logs(&self, task_id: Uuid) -> Result<Vec<LogEntry>, TaskPilotError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, task_id, seq, event_type, payload, timestamp
                     FROM task_logs WHERE task_id = ?1 ORDER BY seq ASC",
                )
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(rusqlite::params![task_id.to_string()], |row| Ok(row_to_log(row)))
                .map_err(storage_err)?;
            let mut entries = Vec::new();
            for row in rows {
                entries.push(row.map_err(storage_err)??);
            }
            Ok(entries)
        })
    }

    /// Realign the stored state with the last logged transition.
    ///
    /// Returns the corrected state when a mismatch was repaired.
    pub fn recover(&self, task_id: Uuid) -> Result<Option<TaskState>, TaskPilotError> {
        self.db.with_transaction(|tx| {
            let stored: Option<String> = tx
                .query_row(
                    "SELECT state FROM tasks WHERE id = ?1",
                    rusqlite::params![task_id.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(storage_err)?;
            let stored: TaskState = match stored {
                Some(s) => s.parse().map_err(|_| {
                    TaskPilotError::Corrupt(format!("Task {} has unknown state {}", task_id, s))
                })?,
                None => return Err(TaskPilotError::NotFound(format!("Task {}", task_id))),
            };

            let last: Option<String> = tx
                .query_row(
                    "SELECT payload FROM task_logs
                     WHERE task_id = ?1 AND event_type = 'state_transition'
                     ORDER BY seq DESC LIMIT 1",
                    rusqlite::params![task_id.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(storage_err)?;
            let logged = match last {
                Some(payload) => {
                    let payload: Value = serde_json::from_str(&payload)?;
                    serde_json::from_value::<TaskState>(payload["to"].clone()).map_err(|e| {
                        TaskPilotError::Corrupt(format!("Bad transition entry: {}", e))
                    })?
                }
                None => TaskState::Init,
            };

            if logged == stored {
                return Ok(None);
            }

            let archived_at = logged.is_terminal().then(|| Timestamp::now().0);
            tx.execute(
                "UPDATE tasks SET state = ?1, updated_at = ?2,
                     archived_at = COALESCE(archived_at, ?3)
                 WHERE id = ?4",
                rusqlite::params![
                    logged.as_str(),
                    Timestamp::now().0,
                    archived_at,
                    task_id.to_string()
                ],
            )
            .map_err(storage_err)?;
            insert_log(
                tx,
                task_id,
                LogEvent::StateRecovered,
                &json!({"stored": stored, "restored": logged}),
            )?;
            Ok(Some(logged))
        })
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn write_mutable_fields(conn: &Connection, task: &Task) -> Result<(), TaskPilotError> {
    let affected = conn
        .execute(
            "UPDATE tasks SET priority = ?1, metadata = ?2, monitor = ?3, suspension = ?4,
                 updated_at = ?5
             WHERE id = ?6",
            rusqlite::params![
                task.priority.as_str(),
                task.metadata.to_string(),
                serde_json::to_string(&task.monitor)?,
                task.suspension
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                Timestamp::now().0,
                task.id.to_string(),
            ],
        )
        .map_err(storage_err)?;
    if affected == 0 {
        return Err(TaskPilotError::NotFound(format!("Task {}", task.id)));
    }

    if let Some(plan) = &task.plan {
        conn.execute(
            "UPDATE plans SET steps = ?1 WHERE id = ?2 AND superseded_at IS NULL",
            rusqlite::params![serde_json::to_string(&plan.steps)?, plan.id.to_string()],
        )
        .map_err(storage_err)?;
    }
    Ok(())
}

fn insert_log(
    conn: &Connection,
    task_id: Uuid,
    event: LogEvent,
    payload: &Value,
) -> Result<LogEntry, TaskPilotError> {
    let seq: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM task_logs WHERE task_id = ?1",
            rusqlite::params![task_id.to_string()],
            |row| row.get(0),
        )
        .map_err(storage_err)?;

    let entry = LogEntry {
        id: Uuid::new_v4(),
        task_id,
        seq,
        event,
        payload: redact_value(payload),
        timestamp: Timestamp::now(),
    };

    conn.execute(
        "INSERT INTO task_logs (id, task_id, seq, event_type, payload, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            entry.id.to_string(),
            task_id.to_string(),
            entry.seq,
            event.as_str(),
            entry.payload.to_string(),
            entry.timestamp.0,
        ],
    )
    .map_err(|e| TaskPilotError::Storage(format!("Failed to append log entry: {}", e)))?;

    Ok(entry)
}

fn load_task(conn: &Connection, id: Uuid) -> Result<Option<Task>, TaskPilotError> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
            rusqlite::params![id.to_string()],
            |row| {
                Ok(TaskRow {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    goal: row.get(2)?,
                    state: row.get(3)?,
                    priority: row.get(4)?,
                    active_plan_id: row.get(5)?,
                    metadata: row.get(6)?,
                    monitor: row.get(7)?,
                    suspension: row.get(8)?,
                    created_at: row.get(9)?,
                    updated_at: row.get(10)?,
                    archived_at: row.get(11)?,
                })
            },
        )
        .optional()
        .map_err(storage_err)?;

    let row = match row {
        Some(row) => row,
        None => return Ok(None),
    };

    let plan = match &row.active_plan_id {
        Some(plan_id) => {
            let plan = conn
                .query_row(
                    &format!("SELECT {} FROM plans WHERE id = ?1", PLAN_COLUMNS),
                    rusqlite::params![plan_id],
                    |r| Ok(row_to_plan(r)),
                )
                .map_err(|e| {
                    TaskPilotError::Corrupt(format!("Active plan {} missing: {}", plan_id, e))
                })??;
            Some(plan)
        }
        None => None,
    };

    row.into_task(plan).map(Some)
}

struct TaskRow {
    id: String,
    user_id: String,
    goal: String,
    state: String,
    priority: String,
    active_plan_id: Option<String>,
    metadata: String,
    monitor: String,
    suspension: Option<String>,
    created_at: i64,
    updated_at: i64,
    archived_at: Option<i64>,
}

impl TaskRow {
    fn into_task(self, plan: Option<Plan>) -> Result<Task, TaskPilotError> {
        let corrupt = |what: &str, e: String| {
            TaskPilotError::Corrupt(format!("Task {} has invalid {}: {}", self.id, what, e))
        };
        let state: TaskState = self
            .state
            .parse()
            .map_err(|e: TaskPilotError| corrupt("state", e.to_string()))?;
        let priority: TaskPriority = self
            .priority
            .parse()
            .map_err(|e: TaskPilotError| corrupt("priority", e.to_string()))?;
        let monitor: MonitorState =
            serde_json::from_str(&self.monitor).map_err(|e| corrupt("monitor", e.to_string()))?;
        let suspension: Option<Suspension> = self
            .suspension
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| corrupt("suspension", e.to_string()))?;
        let metadata: Value =
            serde_json::from_str(&self.metadata).map_err(|e| corrupt("metadata", e.to_string()))?;

        Ok(Task {
            id: parse_uuid(&self.id)?,
            user_id: parse_uuid(&self.user_id)?,
            goal: self.goal,
            state,
            priority,
            plan,
            metadata,
            monitor,
            suspension,
            created_at: Timestamp(self.created_at),
            updated_at: Timestamp(self.updated_at),
            archived_at: self.archived_at.map(Timestamp),
        })
    }
}

fn row_to_plan(row: &rusqlite::Row<'_>) -> Result<Plan, TaskPilotError> {
    let get_err = |e: rusqlite::Error| TaskPilotError::Storage(e.to_string());
    let id: String = row.get(0).map_err(get_err)?;
    let task_id: String = row.get(1).map_err(get_err)?;
    let steps: String = row.get(6).map_err(get_err)?;
    let steps: Vec<PlanStep> = serde_json::from_str(&steps)
        .map_err(|e| TaskPilotError::Corrupt(format!("Plan {} has invalid steps: {}", id, e)))?;

    Ok(Plan {
        id: parse_uuid(&id)?,
        task_id: parse_uuid(&task_id)?,
        version: row.get(2).map_err(get_err)?,
        intent: row.get(3).map_err(get_err)?,
        intent_confidence: row.get(4).map_err(get_err)?,
        reason: row.get(5).map_err(get_err)?,
        steps,
        created_at: Timestamp(row.get(7).map_err(get_err)?),
        superseded_at: row.get::<_, Option<i64>>(8).map_err(get_err)?.map(Timestamp),
    })
}

fn row_to_log(row: &rusqlite::Row<'_>) -> Result<LogEntry, TaskPilotError> {
    let get_err = |e: rusqlite::Error| TaskPilotError::Storage(e.to_string());
    let id: String = row.get(0).map_err(get_err)?;
    let task_id: String = row.get(1).map_err(get_err)?;
    let event: String = row.get(3).map_err(get_err)?;
    let payload: String = row.get(4).map_err(get_err)?;

    Ok(LogEntry {
        id: parse_uuid(&id)?,
        task_id: parse_uuid(&task_id)?,
        seq: row.get(2).map_err(get_err)?,
        event: event
            .parse()
            .map_err(|e: TaskPilotError| TaskPilotError::Corrupt(e.to_string()))?,
        payload: serde_json::from_str(&payload)?,
        timestamp: Timestamp(row.get(5).map_err(get_err)?),
    })
}

pub(crate) fn parse_uuid(s: &str) -> Result<Uuid, TaskPilotError> {
    Uuid::parse_str(s).map_err(|e| TaskPilotError::Corrupt(format!("Invalid UUID {}: {}", s, e)))
}
