//! ShardMeta - per-collection sharded metadata manager
//!
//! One `MetadataManager` exists per sharded collection on a shard. It owns
//! the active chunk ownership map, hands out stable snapshots to queries,
//! ingests refreshed maps from the routing catalog, records ranges being
//! migrated in, and schedules orphaned ranges for background deletion once
//! no query can still observe them.

pub mod cleanup;
pub mod config;
pub mod deleter;
pub mod error;
pub mod manager;
pub mod notification;
pub mod snapshot;

pub use cleanup::{CleanupQueue, Deletion};
pub use config::ManagerConfig;
pub use deleter::RangeDeleter;
pub use error::MetadataError;
pub use manager::{MetadataManager, MetadataReport};
pub use notification::{CleanupNotification, CleanupStatus};
pub use snapshot::ScopedChunkMap;
