//! Per-key async mutexes.
//!
//! Used wherever work must be serialized per application name while
//! different names proceed in parallel (environment creation, coordinator
//! operations).

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type SyncMutex<T> = parking_lot::Mutex<T>;

#[derive(Debug, Default)]
pub struct KeyedLocks {
    /// Uses SyncMutex (parking_lot::Mutex) - only held to look up the entry, never across await.
    locks: SyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Guard for one key; the key is unlocked on drop.
pub type KeyGuard = OwnedMutexGuard<()>;

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: &str) -> KeyGuard {
        self.entry(key).lock_owned().await
    }

    /// Exclusive access to `key` if nobody holds it right now.
    pub fn try_lock(&self, key: &str) -> Option<KeyGuard> {
        self.entry(key).try_lock_owned().ok()
    }

    /// True while some task holds `key`.
    pub fn is_locked(&self, key: &str) -> bool {
        self.locks
            .lock()
            .get(key)
            .is_some_and(|lock| lock.try_lock().is_err())
    }
}
