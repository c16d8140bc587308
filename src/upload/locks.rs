//! Per-upload lock registry
//!
//! Operations that mutate an upload hold its lock for their whole
//! read-check-write sequence. Uploads never share a lock, so unrelated
//! uploads proceed independently. A registry entry lives only as long as
//! some task holds or waits for it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

type Registry = Arc<Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>>;

/// Exclusive access to one upload, released on drop
pub struct RecordGuard {
    id: Uuid,
    registry: Registry,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for RecordGuard {
    fn drop(&mut self) {
        drop(self.guard.take());

        // Clones are only handed out under the registry lock, so a count of
        // one means no other task holds or awaits this entry.
        let mut locks = self.registry.lock();
        if locks.get(&self.id).map_or(false, |entry| Arc::strong_count(entry) == 1) {
            locks.remove(&self.id);
        }
    }
}

#[derive(Default)]
pub struct RecordLocks {
    locks: Registry,
}

impl RecordLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, id: Uuid) -> Arc<AsyncMutex<()>> {
        self.locks.lock().entry(id).or_default().clone()
    }

    fn wrap(&self, id: Uuid, guard: OwnedMutexGuard<()>) -> RecordGuard {
        RecordGuard {
            id,
            registry: self.locks.clone(),
            guard: Some(guard),
        }
    }

    /// Wait for exclusive access to `id`
    pub async fn lock(&self, id: Uuid) -> RecordGuard {
        let guard = self.entry(id).lock_owned().await;
        self.wrap(id, guard)
    }

    /// Take exclusive access to `id` only if nobody holds it
    pub fn try_lock(&self, id: Uuid) -> Option<RecordGuard> {
        // On failure the holder's guard cleans up the entry
        let guard = self.entry(id).try_lock_owned().ok()?;
        Some(self.wrap(id, guard))
    }

    /// Number of uploads currently locked or awaited
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }
}
