//! Device access broker.
//!
//! Serialises flash operations per physical port across every user. The
//! lock is held only for the duration of the closure and is released on
//! success, error, panic or cancellation of the awaiting task.

use std::future::Future;

use crate::locks::LockMap;

/// Per-port mutual exclusion.
#[derive(Debug, Clone, Default)]
pub struct DeviceBroker {
    locks: LockMap<String>,
}

impl DeviceBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` while holding the lock for `port`.
    ///
    /// Blocks without a deadline while another holder is active.
    pub async fn with_lock<F, Fut, T>(&self, port: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lock = self.locks.get(&port.to_string());
        if lock.try_lock().is_err() {
            tracing::info!(port = %port, "port busy, waiting for lock");
        }
        let _guard = lock.lock().await;
        tracing::debug!(port = %port, "port lock acquired");
        f().await
    }

    /// Returns true if a holder currently owns the lock for `port`.
    pub fn is_busy(&self, port: &str) -> bool {
        self.locks.get(&port.to_string()).try_lock().is_err()
    }
}
