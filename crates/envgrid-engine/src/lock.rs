//! Named mutual-exclusion locks.
//!
//! Update entry points serialise on a lock looked up by name rather than a
//! process global: `update:{project}` for calls touching one project's
//! environments and [`BULK_UPDATE_LOCK`] for bulk updates. Tests share a
//! registry with the engine to hold a lock before calling in.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

/// Serialises bulk update callers against each other.
pub const BULK_UPDATE_LOCK: &str = "bulk-update";

/// Name of the lock guarding updates to one project's environments.
pub fn update_lock_name(project: &str) -> String {
    format!("update:{project}")
}

/// Lazily created named locks, shared by clones.
#[derive(Clone, Default)]
pub struct LockRegistry {
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, name: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Wait for the named lock. Released when the guard drops.
    pub async fn acquire(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = self.get(name);
        let guard = lock.lock_owned().await;
        debug!(lock = name, "lock acquired");
        guard
    }

    /// Take the named lock only if nobody holds it.
    pub fn try_acquire(&self, name: &str) -> Option<OwnedMutexGuard<()>> {
        self.get(name).try_lock_owned().ok()
    }
}
