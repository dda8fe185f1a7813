//! Working-context cache keyed by task id, with per-entry expiry.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use uuid::Uuid;

use taskpilot_core::error::TaskPilotError;
use taskpilot_core::types::WorkingContext;

/// Key/value store for ephemeral per-task state.
///
/// Implementations may drop entries at any time. Callers rebuild from the
/// durable store on a miss.
pub trait WorkingStore: Send + Sync {
    fn get(&self, task_id: Uuid) -> Result<Option<WorkingContext>, TaskPilotError>;

    /// Insert or replace, restarting the entry's expiry clock.
    fn put(&self, ctx: WorkingContext) -> Result<(), TaskPilotError>;

    fn remove(&self, task_id: Uuid) -> Result<(), TaskPilotError>;

    /// Drop expired entries. Returns how many were removed.
    fn purge_expired(&self) -> Result<usize, TaskPilotError>;
}

struct Slot {
    stored_at: Instant,
    ctx: WorkingContext,
}

/// Process-local [`WorkingStore`].
pub struct InMemoryWorkingStore {
    ttl: Duration,
    entries: RwLock<HashMap<Uuid, Slot>>,
}

impl InMemoryWorkingStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_err<E: std::fmt::Display>(e: E) -> TaskPilotError {
        TaskPilotError::Memory(format!("Working store lock poisoned: {}", e))
    }
}

impl WorkingStore for InMemoryWorkingStore {
    fn get(&self, task_id: Uuid) -> Result<Option<WorkingContext>, TaskPilotError> {
        let entries = self.entries.read().map_err(Self::lock_err)?;
        Ok(entries
            .get(&task_id)
            .filter(|slot| slot.stored_at.elapsed() < self.ttl)
            .map(|slot| slot.ctx.clone()))
    }

    fn put(&self, ctx: WorkingContext) -> Result<(), TaskPilotError> {
        let mut entries = self.entries.write().map_err(Self::lock_err)?;
        entries.insert(
            ctx.task_id,
            Slot {
                stored_at: Instant::now(),
                ctx,
            },
        );
        Ok(())
    }

    fn remove(&self, task_id: Uuid) -> Result<(), TaskPilotError> {
        let mut entries = self.entries.write().map_err(Self::lock_err)?;
        entries.remove(&task_id);
        Ok(())
    }

    fn purge_expired(&self) -> Result<usize, TaskPilotError> {
        let mut entries = self.entries.write().map_err(Self::lock_err)?;
        let before = entries.len();
        entries.retain(|_, slot| slot.stored_at.elapsed() < self.ttl);
        Ok(before - entries.len())
    }
}
