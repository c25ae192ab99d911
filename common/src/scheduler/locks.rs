// Per-task-id async locks for lifecycle operations

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

/// Keyed async mutexes. Entries are dropped once nobody holds or awaits them.
#[derive(Debug, Default)]
pub struct TaskLocks {
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

/// Held for the duration of one lifecycle operation on a task id
pub struct TaskLockGuard<'a> {
    locks: &'a TaskLocks,
    id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
}

impl TaskLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, id: Uuid) -> TaskLockGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(id).or_default().clone()
        };
        let guard = lock.lock_owned().await;
        TaskLockGuard {
            locks: self,
            id,
            guard: Some(guard),
        }
    }

    /// Number of ids with a live lock entry
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release_if_idle(&self, id: Uuid) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.get(&id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&id);
        }
    }
}

impl Drop for TaskLockGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks.release_if_idle(self.id);
    }
}
