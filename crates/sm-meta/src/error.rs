//! Errors surfaced across the manager boundary

use thiserror::Error;

/// Metadata manager errors
///
/// Conflicts are returned synchronously and never mutate state; abort and
/// deletion failures are delivered through cleanup notifications only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetadataError {
    /// The requested range is owned, pinned by a live query, or mid-migration
    #[error("range operation conflict: {reason}")]
    RangeOverlapConflict { reason: String },

    /// Pending cleanups were abandoned because the collection was dropped,
    /// became unsharded, or changed epoch
    #[error("range deletions in {collection} abandoned: {reason}")]
    InterruptedDueToReplStateChange { collection: String, reason: String },

    /// The external deleter failed while removing documents of a range
    #[error("deletion of range {range} failed: {reason}")]
    DeletionFailed { range: String, reason: String },
}
