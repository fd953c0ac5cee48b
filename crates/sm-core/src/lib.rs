//! Core sharding types for the metadata manager
//!
//! Provides functionality to:
//! - Represent points and half-open ranges in the shard key space
//! - Order chunk versions within a collection epoch
//! - Answer ownership and orphan-range queries against a chunk map

pub mod chunk_map;
pub mod range;
pub mod version;

pub use chunk_map::ChunkMap;
pub use range::{range_map_overlaps, ChunkRange, RangeMap, ShardKey};
pub use version::{ChunkVersion, Epoch};
