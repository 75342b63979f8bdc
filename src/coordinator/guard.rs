use crate::error::{Error, Result};
use crate::sync::{KeyGuard, KeyedLocks};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

type SyncMutex<T> = parking_lot::Mutex<T>;

/// One in-flight operation per application name.
#[derive(Default)]
pub(crate) struct OperationGuards {
    locks: KeyedLocks,
    active: Arc<SyncMutex<HashMap<String, CancellationToken>>>,
}

impl OperationGuards {
    /// Claim `app` or fail with `OperationInProgress`. Never waits.
    pub(crate) fn acquire(&self, app: &str) -> Result<OperationGuard> {
        let lock = self
            .locks
            .try_lock(app)
            .ok_or_else(|| Error::OperationInProgress(app.to_string()))?;
        let cancel = CancellationToken::new();
        self.active.lock().insert(app.to_string(), cancel.clone());
        Ok(OperationGuard {
            app: app.to_string(),
            cancel,
            active: Arc::clone(&self.active),
            _lock: lock,
        })
    }

    /// Cancel the running operation for `app`, if any.
    pub(crate) fn cancel(&self, app: &str) -> bool {
        match self.active.lock().get(app) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_busy(&self, app: &str) -> bool {
        self.locks.is_locked(app)
    }
}

/// Held for the duration of one operation; releases the name on drop.
pub(crate) struct OperationGuard {
    app: String,
    cancel: CancellationToken,
    active: Arc<SyncMutex<HashMap<String, CancellationToken>>>,
    _lock: KeyGuard,
}

impl OperationGuard {
    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.active.lock().remove(&self.app);
    }
}
