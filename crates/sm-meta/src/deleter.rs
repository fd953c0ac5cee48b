//! External range deleter collaborator

use async_trait::async_trait;
use sm_core::ChunkRange;

/// Removes the documents of orphaned ranges, one batch at a time
///
/// The cleanup driver calls `delete_next_batch` repeatedly for the range at
/// the head of the queue. Returning fewer than `max_docs` deleted documents
/// tells the driver the range is exhausted.
#[async_trait]
pub trait RangeDeleter: Send + Sync + 'static {
    async fn delete_next_batch(
        &self,
        collection: &str,
        range: &ChunkRange,
        max_docs: usize,
    ) -> Result<usize, String>;
}
