//! One-shot completion signal for pending range deletions
//!
//! Waiters may appear at any time, before or after the deletion finishes,
//! and any number of clones can wait on the same signal.

use crate::error::MetadataError;
use std::sync::Arc;
use tokio::sync::watch;

/// Final status delivered to waiters of a pending deletion
pub type CleanupStatus = Result<(), MetadataError>;

/// Cloneable handle to a one-shot, multi-waiter completion signal
#[derive(Debug, Clone)]
pub struct CleanupNotification {
    tx: Arc<watch::Sender<Option<CleanupStatus>>>,
}

impl CleanupNotification {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the signal. Every notification fires at most once.
    pub fn notify(&self, status: CleanupStatus) {
        let mut already_fired = false;
        self.tx.send_modify(|slot| {
            already_fired = slot.is_some();
            if !already_fired {
                *slot = Some(status);
            }
        });
        debug_assert!(!already_fired, "cleanup notification fired twice");
    }

    /// The final status, if the signal already fired
    pub fn get(&self) -> Option<CleanupStatus> {
        self.tx.borrow().clone()
    }

    /// Wait for the signal to fire
    pub async fn wait(&self) -> CleanupStatus {
        let mut rx = self.tx.subscribe();
        let fired = rx
            .wait_for(|slot| slot.is_some())
            .await
            .expect("sender is held by this handle");
        fired.clone().expect("wait_for observed a fired status")
    }
}

impl Default for CleanupNotification {
    fn default() -> Self {
        Self::new()
    }
}
