//! Per-task mutual exclusion with a bounded wait.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::OwnedMutexGuard;
use tracing::debug;
use uuid::Uuid;

use crate::error::{EngineError, Result};

/// Keyed map of async mutexes, one per task id.
pub struct TaskLocks {
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
    wait: Duration,
}

impl TaskLocks {
    pub fn new(wait: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            wait,
        }
    }

    fn entry(&self, task_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(task_id).or_default())
    }

    /// Hold the task's lock, or fail with `LockContention` once the wait
    /// runs out. The guard releases on drop.
    pub async fn acquire(&self, task_id: Uuid) -> Result<OwnedMutexGuard<()>> {
        let lock = self.entry(task_id);
        match tokio::time::timeout(self.wait, lock.lock_owned()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                debug!(task_id = %task_id, wait_ms = self.wait.as_millis() as u64, "Task lock contended");
                Err(EngineError::LockContention(task_id))
            }
        }
    }

    /// Drop entries nobody holds or waits on. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - locks.len()
    }

    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_acquire_times_out() {
        let locks = TaskLocks::new(Duration::from_millis(20));
        let id = Uuid::new_v4();

        let guard = locks.acquire(id).await.unwrap();
        let err = locks.acquire(id).await.unwrap_err();
        assert!(matches!(err, EngineError::LockContention(t) if t == id));

        drop(guard);
        assert!(locks.acquire(id).await.is_ok());
    }

    #[tokio::test]
    async fn test_different_tasks_do_not_contend() {
        let locks = TaskLocks::new(Duration::from_millis(20));
        let _a = locks.acquire(Uuid::new_v4()).await.unwrap();
        let _b = locks.acquire(Uuid::new_v4()).await.unwrap();
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_when_released_in_time() {
        let locks = Arc::new(TaskLocks::new(Duration::from_secs(2)));
        let id = Uuid::new_v4();
        let guard = locks.acquire(id).await.unwrap();

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move { locks.acquire(id).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(guard);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_prune_keeps_held_locks() {
        let locks = TaskLocks::new(Duration::from_millis(20));
        let held = Uuid::new_v4();
        let _guard = locks.acquire(held).await.unwrap();
        drop(locks.acquire(Uuid::new_v4()).await.unwrap());

        assert_eq!(locks.prune(), 1);
        assert_eq!(locks.len(), 1);
        assert!(locks.acquire(held).await.is_err());
    }
}
