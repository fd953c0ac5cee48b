//! Scoped snapshot of the collection's chunk ownership
//!
//! A `ScopedChunkMap` pins one chunk map version for the duration of a
//! query. Dropping the last pin of a superseded version lets the manager
//! retire it and release the range deletions it was holding back.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use sm_core::ChunkMap;

use crate::manager::Tracker;

/// Move-only handle pinning one chunk map version
///
/// The pinned map stays readable even after the owning manager is dropped;
/// releasing the handle then skips retirement entirely.
pub struct ScopedChunkMap {
    tracker: Option<Arc<Tracker>>,
}

impl ScopedChunkMap {
    /// Pin `tracker`. The caller must hold the manager lock.
    pub(crate) fn new(tracker: Arc<Tracker>) -> Self {
        tracker.usage.fetch_add(1, Ordering::SeqCst);
        Self {
            tracker: Some(tracker),
        }
    }

    /// The pinned chunk map; `None` while the collection is not sharded
    pub fn get(&self) -> Option<&ChunkMap> {
        self.tracker.as_ref().and_then(|t| t.metadata.as_ref())
    }

    /// Whether this snapshot observes a sharded collection
    pub fn is_sharded(&self) -> bool {
        self.get().is_some()
    }
}

impl Drop for ScopedChunkMap {
    fn drop(&mut self) {
        let Some(tracker) = self.tracker.take() else {
            return;
        };
        // Resolve the back-reference and release its lock before touching
        // the manager lock; the manager's drop nulls back-references under
        // the tracker lock without holding its own lock.
        let manager = {
            let backref = tracker.backref.lock();
            backref.as_ref().and_then(Weak::upgrade)
        };
        let Some(manager) = manager else {
            // Manager already destroyed; the pin dies with the handle.
            return;
        };

        let mut state = manager.state.lock();
        let previous = tracker.usage.fetch_sub(1, Ordering::SeqCst);
        assert!(previous != 0, "snapshot released with zero usage count");
        if previous == 1 && !state.shutting_down {
            manager.retire_expired(&mut state);
        }
    }
}
