//! Immutable chunk ownership map for one shard
//!
//! A `ChunkMap` is the authoritative answer to "which key ranges does this
//! shard own" at a single routing version. The metadata manager keeps old
//! instances alive while queries still reference them, so the type is a
//! plain immutable value.

use crate::range::{range_map_overlaps, ChunkRange, RangeMap, ShardKey};
use crate::version::{ChunkVersion, Epoch};
use std::ops::Bound;

/// The set of key ranges owned by this shard at one routing version
#[derive(Debug, Clone)]
pub struct ChunkMap {
    /// Owned chunks: min -> max, pairwise disjoint
    chunks: RangeMap,
    /// Version of the whole collection's routing
    coll_version: ChunkVersion,
    /// This shard's version
    shard_version: ChunkVersion,
}

impl ChunkMap {
    /// Build a chunk map from its owned ranges.
    ///
    /// Panics if `coll_version` is the unsharded sentinel or any two chunks
    /// overlap.
    pub fn new(
        chunks: impl IntoIterator<Item = ChunkRange>,
        coll_version: ChunkVersion,
        shard_version: ChunkVersion,
    ) -> Self {
        assert!(
            coll_version.is_sharded() && shard_version.is_sharded(),
            "chunk map requires sharded versions"
        );
        let mut map = RangeMap::new();
        for chunk in chunks {
            assert!(
                !range_map_overlaps(&map, chunk.min(), chunk.max()),
                "overlapping chunk {}",
                chunk
            );
            map.insert(chunk.min().clone(), chunk.max().clone());
        }
        Self {
            chunks: map,
            coll_version,
            shard_version,
        }
    }

    /// The ranges this shard owns, in key order
    pub fn chunks(&self) -> impl Iterator<Item = ChunkRange> + '_ {
        self.chunks
            .iter()
            .map(|(min, max)| ChunkRange::new(min.clone(), max.clone()))
    }

    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn coll_version(&self) -> ChunkVersion {
        self.coll_version
    }

    pub fn shard_version(&self) -> ChunkVersion {
        self.shard_version
    }

    pub fn epoch(&self) -> Epoch {
        self.coll_version.epoch
    }

    /// Check whether `range` intersects any owned chunk
    pub fn range_overlaps_chunk(&self, range: &ChunkRange) -> bool {
        range_map_overlaps(&self.chunks, range.min(), range.max())
    }

    /// Next maximal key range at or after `from` that is covered neither by
    /// an owned chunk nor by an entry of `exclude`
    ///
    /// `exclude` carries the ranges currently being migrated in; documents
    /// there are not owned yet but must not be treated as orphaned.
    pub fn next_orphan_range(&self, exclude: &RangeMap, from: &ShardKey) -> Option<ChunkRange> {
        let mut lo = from.clone();
        loop {
            if lo == ShardKey::Max {
                return None;
            }
            // Skip past whichever owned or excluded range covers `lo`.
            let covered = [&self.chunks, exclude]
                .into_iter()
                .filter_map(|map| covering_max(map, &lo))
                .max();
            if let Some(max) = covered {
                lo = max;
                continue;
            }
            let hi = [&self.chunks, exclude]
                .into_iter()
                .filter_map(|map| next_min_after(map, &lo))
                .min()
                .unwrap_or(ShardKey::Max);
            return Some(ChunkRange::new(lo, hi));
        }
    }

    /// Compact rendering for log lines
    pub fn to_string_basic(&self) -> String {
        format!(
            "{{{} chunks, coll version {}, shard version {}}}",
            self.chunks.len(),
            self.coll_version,
            self.shard_version
        )
    }
}

/// Max of the entry covering `key`, if one does
fn covering_max(map: &RangeMap, key: &ShardKey) -> Option<ShardKey> {
    map.range((Bound::Unbounded, Bound::Included(key)))
        .next_back()
        .and_then(|(_, max)| (max > key).then(|| max.clone()))
}

/// Smallest entry min strictly greater than `key`
fn next_min_after(map: &RangeMap, key: &ShardKey) -> Option<ShardKey> {
    map.range((Bound::Excluded(key), Bound::Unbounded))
        .next()
        .map(|(min, _)| min.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(b: u8) -> ShardKey {
        ShardKey::Key(vec![b])
    }

    fn map(ranges: &[(u8, u8)]) -> ChunkMap {
        let epoch = Epoch::new();
        ChunkMap::new(
            ranges
                .iter()
                .map(|&(lo, hi)| ChunkRange::new(key(lo), key(hi))),
            ChunkVersion::new(1, 0, epoch),
            ChunkVersion::new(1, 0, epoch),
        )
    }

    #[test]
    fn test_range_overlaps_chunk() {
        let m = map(&[(10, 20), (30, 40)]);
        assert!(m.range_overlaps_chunk(&ChunkRange::new(key(15), key(35))));
        assert!(m.range_overlaps_chunk(&ChunkRange::new(key(5), key(11))));
        assert!(!m.range_overlaps_chunk(&ChunkRange::new(key(20), key(30))));
        assert!(!m.range_overlaps_chunk(&ChunkRange::new(key(40), ShardKey::Max)));
    }

    #[test]
    #[should_panic(expected = "overlapping chunk")]
    fn test_rejects_overlapping_chunks() {
        let _ = map(&[(10, 20), (15, 25)]);
    }

    #[test]
    #[should_panic(expected = "sharded versions")]
    fn test_rejects_unsharded_version() {
        let _ = ChunkMap::new([], ChunkVersion::unsharded(), ChunkVersion::unsharded());
    }

    #[test]
    fn test_next_orphan_range_walks_gaps() {
        let m = map(&[(10, 20), (30, 40)]);
        let exclude = RangeMap::new();

        assert_eq!(
            m.next_orphan_range(&exclude, &ShardKey::Min),
            Some(ChunkRange::new(ShardKey::Min, key(10)))
        );
        assert_eq!(
            m.next_orphan_range(&exclude, &key(10)),
            Some(ChunkRange::new(key(20), key(30)))
        );
        assert_eq!(
            m.next_orphan_range(&exclude, &key(25)),
            Some(ChunkRange::new(key(25), key(30)))
        );
        assert_eq!(
            m.next_orphan_range(&exclude, &key(30)),
            Some(ChunkRange::new(key(40), ShardKey::Max))
        );
        assert_eq!(m.next_orphan_range(&exclude, &ShardKey::Max), None);
    }

    #[test]
    fn test_next_orphan_range_respects_exclusions() {
        let m = map(&[(10, 20)]);
        let mut exclude = RangeMap::new();
        exclude.insert(key(30), key(40));

        assert_eq!(
            m.next_orphan_range(&exclude, &key(20)),
            Some(ChunkRange::new(key(20), key(30)))
        );
        assert_eq!(
            m.next_orphan_range(&exclude, &key(30)),
            Some(ChunkRange::new(key(40), ShardKey::Max))
        );
        // Adjacent owned and excluded ranges are skipped in one step.
        exclude.insert(key(20), key(30));
        assert_eq!(
            m.next_orphan_range(&exclude, &key(10)),
            Some(ChunkRange::new(key(40), ShardKey::Max))
        );
    }

    #[test]
    fn test_next_orphan_range_with_no_chunks() {
        let epoch = Epoch::new();
        let m = ChunkMap::new(
            [],
            ChunkVersion::new(1, 0, epoch),
            ChunkVersion::new(1, 0, epoch),
        );
        assert_eq!(
            m.next_orphan_range(&RangeMap::new(), &ShardKey::Min),
            Some(ChunkRange::new(ShardKey::Min, ShardKey::Max))
        );
    }

    #[test]
    fn test_to_string_basic() {
        let m = map(&[(10, 20)]);
        let s = m.to_string_basic();
        assert!(s.starts_with("{1 chunks"), "unexpected rendering: {}", s);
    }
}
