//! Durable backing for semantic memory.
//!
//! Embeddings are stored as JSON arrays next to the content so the
//! in-memory index can be rebuilt on startup.

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use taskpilot_core::error::TaskPilotError;
use taskpilot_core::types::{SemanticRecord, Timestamp};

use crate::db::{storage_err, Database};
use crate::tasks::parse_uuid;

pub struct SemanticRepository {
    db: Arc<Database>,
}

impl SemanticRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn insert(&self, record: &SemanticRecord, embedding: &[f32]) -> Result<(), TaskPilotError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO semantic_memories (id, user_id, content, embedding, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    record.id.to_string(),
                    record.user_id.to_string(),
                    record.content,
                    serde_json::to_string(embedding)?,
                    record.metadata.to_string(),
                    record.created_at.0,
                ],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    TaskPilotError::NotFound(format!("User {}", record.user_id))
                }
                other => TaskPilotError::Storage(format!("Failed to store memory: {}", other)),
            })?;
            Ok(())
        })
    }

    /// Every stored record with its embedding, for index rebuilds.
    pub fn load_all(&self) -> Result<Vec<(SemanticRecord, Vec<f32>)>, TaskPilotError> {
        self.query("SELECT id, user_id, content, embedding, metadata, created_at
                    FROM semantic_memories ORDER BY created_at ASC", None)
    }

    pub fn for_user(&self, user_id: Uuid) -> Result<Vec<(SemanticRecord, Vec<f32>)>, TaskPilotError> {
        self.query(
            "SELECT id, user_id, content, embedding, metadata, created_at
             FROM semantic_memories WHERE user_id = ?1 ORDER BY created_at ASC",
            Some(user_id),
        )
    }

    pub fn count(&self) -> Result<usize, TaskPilotError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn
                .query_row("SELECT COUNT(*) FROM semantic_memories", [], |row| row.get(0))
                .map_err(storage_err)?;
            Ok(n as usize)
        })
    }

    fn query(
        &self,
        sql: &str,
        user_id: Option<Uuid>,
    ) -> Result<Vec<(SemanticRecord, Vec<f32>)>, TaskPilotError> {
        let rows = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(sql).map_err(storage_err)?;
            let rows = match user_id {
                Some(user_id) => stmt
                    .query_map(rusqlite::params![user_id.to_string()], memory_row)
                    .map_err(storage_err)?
                    .collect::<Result<Vec<_>, _>>(),
                None => stmt
                    .query_map([], memory_row)
                    .map_err(storage_err)?
                    .collect::<Result<Vec<_>, _>>(),
            }
            .map_err(storage_err)?;
            Ok(rows)
        })?;

        rows.into_iter()
            .map(|(id, user_id, content, embedding, metadata, created_at)| {
                let embedding: Vec<f32> = serde_json::from_str(&embedding).map_err(|e| {
                    TaskPilotError::Corrupt(format!("Memory {} has invalid embedding: {}", id, e))
                })?;
                let metadata: Value = serde_json::from_str(&metadata)?;
                Ok((
                    SemanticRecord {
                        id: parse_uuid(&id)?,
                        user_id: parse_uuid(&user_id)?,
                        content,
                        metadata,
                        created_at: Timestamp(created_at),
                    },
                    embedding,
                ))
            })
            .collect()
    }
}

type MemoryRow = (String, String, String, String, String, i64);

fn memory_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}
