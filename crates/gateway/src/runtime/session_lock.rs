//! Per-session teardown serialisation.
//!
//! Every state transition for a given session id runs under that id's
//! lock, so two concurrent `remove` calls collapse into one effective
//! teardown while different sessions proceed in parallel. There is no
//! global lock anywhere on the request path.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Map of session id → `Semaphore(1)`. Holding the permit is holding
/// the session's transition lock; it auto-releases on drop.
#[derive(Default)]
pub struct SessionLockMap {
    locks: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl SessionLockMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the transition lock for a session. Waits behind any
    /// in-flight transition for the same id; teardown steps are bounded
    /// (grace-limited), so waiters are not parked for long.
    pub async fn acquire(&self, session_id: &str) -> OwnedSemaphorePermit {
        let sem = {
            let mut locks = self.locks.lock();
            locks
                .entry(session_id.to_owned())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };
        // The semaphore is never closed, so acquisition cannot fail.
        match sem.acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => unreachable!("session lock semaphore is never closed"),
        }
    }

    /// Number of tracked sessions (for monitoring).
    pub fn session_count(&self) -> usize {
        self.locks.lock().len()
    }

    /// Drop locks nobody is holding. Called from the periodic cleanup
    /// task so ended sessions do not accumulate map entries.
    pub fn prune_idle(&self) {
        let mut locks = self.locks.lock();
        locks.retain(|_, sem| sem.available_permits() == 0);
    }
}
