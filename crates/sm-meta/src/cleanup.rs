//! Background deletion queue for orphaned ranges
//!
//! Ranges queued here have left this shard's ownership and are removed by
//! the external deleter one batch at a time. The queue carries its own lock;
//! the manager lock is never needed on the deletion path.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tracing::{debug, warn};

use sm_core::ChunkRange;

use crate::deleter::RangeDeleter;
use crate::error::MetadataError;
use crate::notification::CleanupNotification;

/// A queued range deletion and its completion signal
#[derive(Debug, Clone)]
pub struct Deletion {
    pub range: ChunkRange,
    pub notification: CleanupNotification,
}

impl Deletion {
    pub fn new(range: ChunkRange) -> Self {
        Self {
            range,
            notification: CleanupNotification::new(),
        }
    }
}

/// FIFO of pending range deletions
///
/// The head entry stays queued until the deleter reports its range
/// exhausted, so emptiness observed under the queue lock is an accurate
/// "no work left" signal.
#[derive(Debug, Default)]
pub struct CleanupQueue {
    ranges: Mutex<VecDeque<Deletion>>,
}

impl CleanupQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append deletions. Returns whether this transitioned the queue from
    /// empty to non-empty, the caller's cue to schedule the driver.
    pub fn add(&self, list: impl IntoIterator<Item = Deletion>) -> bool {
        let mut ranges = self.ranges.lock();
        let was_empty = ranges.is_empty();
        ranges.extend(list);
        was_empty && !ranges.is_empty()
    }

    /// Notification of the first queued deletion overlapping `range`
    pub fn overlaps(&self, range: &ChunkRange) -> Option<CleanupNotification> {
        self.ranges
            .lock()
            .iter()
            .find(|deletion| deletion.range.overlaps(range))
            .map(|deletion| deletion.notification.clone())
    }

    pub fn len(&self) -> usize {
        self.ranges.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.lock().is_empty()
    }

    /// Abort every pending deletion, firing its notification with `error`
    /// in queue order
    pub fn clear(&self, error: MetadataError) {
        let drained: Vec<Deletion> = {
            let mut ranges = self.ranges.lock();
            ranges.drain(..).collect()
        };
        for deletion in &drained {
            deletion.notification.notify(Err(error.clone()));
        }
    }

    /// Ranges currently queued, head first (diagnostics)
    pub fn ranges(&self) -> Vec<ChunkRange> {
        self.ranges
            .lock()
            .iter()
            .map(|deletion| deletion.range.clone())
            .collect()
    }

    fn head_range(&self) -> Option<ChunkRange> {
        self.ranges
            .lock()
            .front()
            .map(|deletion| deletion.range.clone())
    }
}

/// One driver pass: delete a batch of documents from the head range.
///
/// Returns whether more work remains. The head entry is popped only when
/// its range is exhausted, and the pop and the more-work decision are taken
/// under the queue lock, so the empty-to-non-empty trigger in `add` stays
/// the single scheduling point and at most one driver runs at a time.
pub(crate) async fn delete_next_batch(
    queue: &CleanupQueue,
    deleter: &dyn RangeDeleter,
    collection: &str,
    max_docs: usize,
) -> bool {
    let Some(range) = queue.head_range() else {
        return false;
    };

    let outcome = deleter.delete_next_batch(collection, &range, max_docs).await;

    let mut ranges = queue.ranges.lock();
    // The queue may have been cleared while the deleter ran; only settle the
    // entry this pass actually worked on.
    let finished = match ranges.front() {
        Some(head) if head.range == range => match &outcome {
            Ok(deleted) if *deleted >= max_docs => None,
            _ => ranges.pop_front(),
        },
        _ => None,
    };
    let more = !ranges.is_empty();
    drop(ranges);

    match (&outcome, finished) {
        (Ok(deleted), Some(done)) => {
            debug!(
                "Deleted {} documents of {} range {}; range is clean",
                deleted, collection, done.range
            );
            done.notification.notify(Ok(()));
        }
        (Ok(deleted), None) => {
            debug!(
                "Deleted {} documents of {} range {}; more remain",
                deleted, collection, range
            );
        }
        (Err(reason), Some(done)) => {
            warn!(
                "Failed to delete documents of {} range {}: {}",
                collection, done.range, reason
            );
            done.notification.notify(Err(MetadataError::DeletionFailed {
                range: done.range.to_string(),
                reason: reason.clone(),
            }));
        }
        (Err(_), None) => {}
    }

    more
}

#[cfg(test)]
mod tests {
    use super::*;
    use sm_core::ShardKey;

    fn range(lo: u8, hi: u8) -> ChunkRange {
        ChunkRange::new(ShardKey::Key(vec![lo]), ShardKey::Key(vec![hi]))
    }

    #[test]
    fn test_add_reports_empty_transition() {
        let queue = CleanupQueue::new();
        assert!(!queue.add([]));
        assert!(queue.add([Deletion::new(range(0, 10))]));
        assert!(!queue.add([Deletion::new(range(10, 20))]));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_overlaps_finds_queued_range() {
        let queue = CleanupQueue::new();
        let deletion = Deletion::new(range(0, 10));
        let notification = deletion.notification.clone();
        queue.add([deletion]);

        let found = queue.overlaps(&range(5, 15)).expect("overlap expected");
        notification.notify(Ok(()));
        assert_eq!(found.get(), Some(Ok(())));
        assert!(queue.overlaps(&range(10, 20)).is_none());
    }

    #[test]
    fn test_clear_fires_all_notifications() {
        let queue = CleanupQueue::new();
        let first = Deletion::new(range(0, 10));
        let second = Deletion::new(range(20, 30));
        let (n1, n2) = (first.notification.clone(), second.notification.clone());
        queue.add([first, second]);

        let error = MetadataError::InterruptedDueToReplStateChange {
            collection: "test.coll".to_string(),
            reason: "collection epoch changed".to_string(),
        };
        queue.clear(error.clone());

        assert!(queue.is_empty());
        assert_eq!(n1.get(), Some(Err(error.clone())));
        assert_eq!(n2.get(), Some(Err(error)));
    }
}
