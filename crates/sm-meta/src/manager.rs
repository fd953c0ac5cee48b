//! Per-collection metadata manager
//!
//! One instance exists per sharded collection on a shard. It owns the active
//! chunk map, retains superseded maps while queries still pin them, records
//! ranges being migrated in, and feeds the background cleanup queue.
//!
//! Superseded trackers are kept in a list ordered oldest (front) to newest
//! (back). A tracker is retired only when its pin count is zero and every
//! older tracker is already retired; retirement releases the deletions that
//! were anchored behind it. Deferred deletions always anchor to the active
//! tracker so that queries starting after the request still delay them.

use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tracing::{debug, info};

use sm_core::{range_map_overlaps, ChunkMap, ChunkRange, RangeMap, ShardKey};

use crate::cleanup::{self, CleanupQueue, Deletion};
use crate::config::ManagerConfig;
use crate::deleter::RangeDeleter;
use crate::error::MetadataError;
use crate::notification::CleanupNotification;
use crate::snapshot::ScopedChunkMap;

/// Retirement-capable wrapper around one chunk map version
pub(crate) struct Tracker {
    /// `None` while the collection is not sharded
    pub(crate) metadata: Option<ChunkMap>,
    /// Live snapshot handles pinning this version; mutated only under the
    /// manager lock
    pub(crate) usage: AtomicU32,
    /// Link back to the owning manager; cleared at manager teardown, read
    /// by snapshot handles at release
    pub(crate) backref: Mutex<Option<Weak<ManagerInner>>>,
}

/// A tracker plus the deletions waiting for it and its elders to retire
struct TrackedEntry {
    tracker: Arc<Tracker>,
    orphans: Vec<Deletion>,
}

pub(crate) struct ManagerState {
    pub(crate) shutting_down: bool,
    active: TrackedEntry,
    /// Superseded versions still of interest to queries; front = oldest
    in_use: VecDeque<TrackedEntry>,
    /// Ranges being migrated into this shard: min -> max
    receiving: RangeMap,
}

pub(crate) struct ManagerInner {
    collection: String,
    config: ManagerConfig,
    executor: Handle,
    deleter: Arc<dyn RangeDeleter>,
    pub(crate) state: Mutex<ManagerState>,
    ranges_to_clean: CleanupQueue,
    weak_self: Weak<ManagerInner>,
}

/// Synchronization hub for one sharded collection's chunk ownership
pub struct MetadataManager {
    inner: Arc<ManagerInner>,
}

impl MetadataManager {
    /// Create a manager for `collection` in the unsharded state.
    ///
    /// `executor` runs the background cleanup task; `deleter` is the
    /// collaborator that physically removes documents.
    pub fn new(
        collection: impl Into<String>,
        config: ManagerConfig,
        executor: Handle,
        deleter: Arc<dyn RangeDeleter>,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<ManagerInner>| ManagerInner {
            collection: collection.into(),
            config,
            executor,
            deleter,
            state: Mutex::new(ManagerState {
                shutting_down: false,
                active: TrackedEntry {
                    tracker: Arc::new(Tracker {
                        metadata: None,
                        usage: AtomicU32::new(0),
                        backref: Mutex::new(Some(weak.clone())),
                    }),
                    orphans: Vec::new(),
                },
                in_use: VecDeque::new(),
                receiving: RangeMap::new(),
            }),
            ranges_to_clean: CleanupQueue::new(),
            weak_self: weak.clone(),
        });
        Self { inner }
    }

    pub fn collection(&self) -> &str {
        &self.inner.collection
    }

    /// Snapshot of the active chunk map, pinned until the handle drops
    ///
    /// The handle reports `is_sharded() == false` while the collection has
    /// no chunk map.
    pub fn active_metadata(&self) -> ScopedChunkMap {
        let state = self.inner.state.lock();
        ScopedChunkMap::new(state.active.tracker.clone())
    }

    /// Number of superseded chunk map versions still retained
    pub fn in_use_count(&self) -> usize {
        self.inner.state.lock().in_use.len()
    }

    /// Ingest a refreshed chunk map from the routing catalog.
    ///
    /// `None` means the catalog no longer knows the collection as sharded.
    /// Stale maps are ignored; an epoch change resets migrate-in and
    /// cleanup state entirely.
    pub fn refresh(&self, remote: Option<ChunkMap>) {
        let inner = &self.inner;
        let mut state = inner.state.lock();

        // Never sharded and still not sharded: nothing to do. Callers probe
        // every collection on refresh regardless of sharding state.
        if remote.is_none() && state.active.tracker.metadata.is_none() {
            assert!(state.receiving.is_empty());
            assert!(inner.ranges_to_clean.is_empty());
            return;
        }

        let Some(remote) = remote else {
            // Collection is becoming unsharded.
            let active_desc = state
                .active
                .tracker
                .metadata
                .as_ref()
                .map(ChunkMap::to_string_basic)
                .unwrap_or_default();
            info!(
                "Marking collection {} with {} as no longer sharded",
                inner.collection, active_desc
            );
            state.receiving.clear();
            inner.install_active(&mut state, None);
            inner.clear_all_cleanups(&mut state, "collection dropped or became unsharded");
            return;
        };

        assert!(
            remote.coll_version().is_sharded() && remote.shard_version().is_sharded(),
            "refresh must never install unsharded chunk versions"
        );

        let Some(active) = state.active.tracker.metadata.as_ref() else {
            // Collection is becoming sharded.
            info!(
                "Marking collection {} as sharded with {}",
                inner.collection,
                remote.to_string_basic()
            );
            assert!(state.receiving.is_empty());
            assert!(inner.ranges_to_clean.is_empty());
            inner.install_active(&mut state, Some(remote));
            return;
        };
        let active_desc = active.to_string_basic();

        // A different epoch means the collection was dropped and recreated;
        // nothing carries over.
        if active.epoch() != remote.epoch() {
            info!(
                "Overwriting metadata for collection {} from {} to {} due to epoch change",
                inner.collection,
                active_desc,
                remote.to_string_basic()
            );
            state.receiving.clear();
            inner.install_active(&mut state, Some(remote));
            inner.clear_all_cleanups(&mut state, "collection epoch changed");
            return;
        }

        if active.coll_version() >= remote.coll_version() {
            debug!(
                "Ignoring refresh of active metadata {} with an older {}",
                active_desc,
                remote.to_string_basic()
            );
            return;
        }

        info!(
            "Refreshing metadata for collection {} from {} to {}",
            inner.collection,
            active_desc,
            remote.to_string_basic()
        );

        // Chunks we were receiving that the new map owns have finished
        // migrating in; they are no longer pending.
        let collection = inner.collection.as_str();
        state.receiving.retain(|min, max| {
            let range = ChunkRange::new(min.clone(), max.clone());
            if remote.range_overlaps_chunk(&range) {
                debug!(
                    "Verified chunk {} for collection {} was migrated to this shard",
                    range, collection
                );
                false
            } else {
                true
            }
        });

        inner.install_active(&mut state, Some(remote));
    }

    /// Start receiving `range` via migration.
    ///
    /// Rejects ranges that any query might still observe. On success the
    /// range is remembered as pending and any stale documents left in it by
    /// an earlier migration are scheduled for deletion; the returned
    /// notification fires when that wipe completes.
    pub fn begin_receive(&self, range: ChunkRange) -> Result<CleanupNotification, MetadataError> {
        let inner = &self.inner;
        let mut state = inner.state.lock();

        if ManagerInner::overlaps_in_use_chunk(&state, &range) {
            return Err(MetadataError::RangeOverlapConflict {
                reason: format!(
                    "documents in range {} may still be in use on this shard",
                    range
                ),
            });
        }
        if range_map_overlaps(&state.receiving, range.min(), range.max()) {
            return Err(MetadataError::RangeOverlapConflict {
                reason: format!("range {} overlaps a chunk already being migrated in", range),
            });
        }

        state
            .receiving
            .insert(range.min().clone(), range.max().clone());
        info!(
            "Scheduling deletion of any documents in {} range {} before migrating in a chunk covering the range",
            inner.collection, range
        );
        Ok(inner.push_range_to_clean(&mut state, range))
    }

    /// Abandon an in-migration of `range`.
    ///
    /// Any documents already copied are scheduled for deletion; nobody waits
    /// on this abort-path cleanup.
    pub fn forget_receive(&self, range: &ChunkRange) {
        let inner = &self.inner;
        let mut state = inner.state.lock();

        info!(
            "Abandoning in-migration of {} range {}; scheduling deletion of any documents already copied",
            inner.collection, range
        );
        assert!(
            !ManagerInner::overlaps_in_use_chunk(&state, range),
            "abandoned range {} overlaps an in-use chunk",
            range
        );

        let removed = state.receiving.remove(range.min());
        assert!(removed.is_some(), "range {} was not being received", range);

        inner.push_list_to_clean(&mut state, vec![Deletion::new(range.clone())]);
    }

    /// Schedule deletion of the documents of a chunk that migrated off this
    /// shard.
    ///
    /// If no outstanding query can observe `range` the deletion is queued
    /// immediately; otherwise it is anchored behind the active tracker and
    /// queued once every query that might observe it has finished. The
    /// returned notification fires when the documents are gone.
    pub fn clean_up_range(&self, range: ChunkRange) -> Result<CleanupNotification, MetadataError> {
        let inner = &self.inner;
        let mut state = inner.state.lock();

        let metadata = state
            .active
            .tracker
            .metadata
            .as_ref()
            .expect("cleanUpRange requires sharded metadata");

        if metadata.range_overlaps_chunk(&range) {
            return Err(MetadataError::RangeOverlapConflict {
                reason: format!("deletion range {} overlaps a live shard chunk", range),
            });
        }
        if range_map_overlaps(&state.receiving, range.min(), range.max()) {
            return Err(MetadataError::RangeOverlapConflict {
                reason: format!(
                    "deletion range {} overlaps a chunk being migrated in",
                    range
                ),
            });
        }

        if !ManagerInner::overlaps_in_use_chunk(&state, &range) {
            // No running query can depend on the range.
            info!(
                "Scheduling {} range {} for immediate deletion",
                inner.collection, range
            );
            return Ok(inner.push_range_to_clean(&mut state, range));
        }

        let deletion = Deletion::new(range.clone());
        let notification = deletion.notification.clone();
        state.active.orphans.push(deletion);
        info!(
            "Scheduling {} range {} for deletion after all possibly-dependent queries finish",
            inner.collection, range
        );
        Ok(notification)
    }

    /// Ranges queued for background deletion
    pub fn number_of_ranges_to_clean(&self) -> usize {
        self.inner.ranges_to_clean.len()
    }

    /// Deletions still anchored behind the active or a pinned tracker
    pub fn number_of_ranges_to_clean_still_in_use(&self) -> usize {
        let state = self.inner.state.lock();
        state.active.orphans.len()
            + state
                .in_use
                .iter()
                .map(|entry| entry.orphans.len())
                .sum::<usize>()
    }

    /// Notification of any pending deletion overlapping `range`, whether
    /// still anchored or already queued; `None` if the range is clean
    pub fn track_orphaned_data_cleanup(&self, range: &ChunkRange) -> Option<CleanupNotification> {
        let state = self.inner.state.lock();
        if let Some(notification) = ManagerInner::overlaps_in_use_cleanups(&state, range) {
            return Some(notification);
        }
        self.inner.ranges_to_clean.overlaps(range)
    }

    /// Next range of orphaned keys at or after `from`, skipping ranges
    /// currently being migrated in
    pub fn next_orphan_range(&self, from: &ShardKey) -> Option<ChunkRange> {
        let state = self.inner.state.lock();
        let metadata = state
            .active
            .tracker
            .metadata
            .as_ref()
            .expect("getNextOrphanRange requires sharded metadata");
        metadata.next_orphan_range(&state.receiving, from)
    }

    /// Snapshot of the manager's bookkeeping for diagnostics
    pub fn report(&self) -> MetadataReport {
        let state = self.inner.state.lock();
        MetadataReport {
            ranges_to_clean: self.inner.ranges_to_clean.ranges(),
            pending_chunks: state
                .receiving
                .iter()
                .map(|(min, max)| ChunkRange::new(min.clone(), max.clone()))
                .collect(),
            active_metadata_ranges: state
                .active
                .tracker
                .metadata
                .as_ref()
                .map(|metadata| metadata.chunks().collect())
                .unwrap_or_default(),
        }
    }
}

impl Drop for MetadataManager {
    fn drop(&mut self) {
        let inner = &self.inner;
        let trackers: Vec<Arc<Tracker>> = {
            let mut state = inner.state.lock();
            state.shutting_down = true;
            inner.clear_all_cleanups(&mut state, "collection dropped or became unsharded");
            let mut trackers: Vec<Arc<Tracker>> = state
                .in_use
                .drain(..)
                .map(|entry| entry.tracker)
                .collect();
            trackers.push(state.active.tracker.clone());
            trackers
        };
        // Trackers can outlive the manager, so sever each back-reference
        // under its own lock; late snapshot releases then skip retirement.
        for tracker in trackers {
            *tracker.backref.lock() = None;
        }
    }
}

impl ManagerInner {
    /// Replace the active tracker, pushing the superseded one onto the
    /// in-use list. Call with the manager lock held.
    fn install_active(&self, state: &mut ManagerState, metadata: Option<ChunkMap>) {
        let fresh = TrackedEntry {
            tracker: Arc::new(Tracker {
                metadata,
                usage: AtomicU32::new(0),
                backref: Mutex::new(Some(self.weak_self.clone())),
            }),
            orphans: Vec::new(),
        };
        let superseded = mem::replace(&mut state.active, fresh);
        state.in_use.push_back(superseded);
        // The push may have produced an immediately-retirable tracker.
        self.retire_expired(state);
    }

    /// Retire unpinned trackers front to back, promoting their deletions to
    /// the cleanup queue. Stops at the first tracker still pinned, so a
    /// range is only released once no query could observe it or anything
    /// older. Call with the manager lock held.
    pub(crate) fn retire_expired(&self, state: &mut ManagerState) {
        while let Some(front) = state.in_use.front() {
            if front.tracker.usage.load(Ordering::SeqCst) != 0 {
                break;
            }
            if let Some(retired) = state.in_use.pop_front() {
                if !retired.orphans.is_empty() {
                    info!(
                        "Queries possibly dependent on {} range(s) finished; scheduling for deletion",
                        self.collection
                    );
                    self.push_list_to_clean(state, retired.orphans);
                }
            }
        }
        if state.in_use.is_empty() && !state.active.orphans.is_empty() {
            // No pre-existing query can block these any longer.
            info!(
                "Queries possibly dependent on {} range(s) finished; scheduling for deletion",
                self.collection
            );
            let orphans = mem::take(&mut state.active.orphans);
            self.push_list_to_clean(state, orphans);
        }
    }

    fn push_range_to_clean(&self, state: &mut ManagerState, range: ChunkRange) -> CleanupNotification {
        let deletion = Deletion::new(range);
        let notification = deletion.notification.clone();
        self.push_list_to_clean(state, vec![deletion]);
        notification
    }

    fn push_list_to_clean(&self, state: &mut ManagerState, ranges: Vec<Deletion>) {
        if self.ranges_to_clean.add(ranges) && !state.shutting_down {
            self.schedule_cleanup();
        }
    }

    /// Spawn the single background deletion task. Runs until it observes an
    /// empty queue; `CleanupQueue::add` reports the transition that warrants
    /// the next spawn.
    fn schedule_cleanup(&self) {
        let Some(inner) = self.weak_self.upgrade() else {
            return;
        };
        self.executor.spawn(async move {
            while cleanup::delete_next_batch(
                &inner.ranges_to_clean,
                inner.deleter.as_ref(),
                &inner.collection,
                inner.config.max_delete_batch,
            )
            .await
            {}
        });
    }

    /// Abort every pending deletion, anchored or queued, with
    /// `InterruptedDueToReplStateChange`. Call with the manager lock held.
    fn clear_all_cleanups(&self, state: &mut ManagerState, reason: &str) {
        let mut orphans: Vec<Deletion> = Vec::new();
        for entry in state.in_use.iter_mut() {
            orphans.append(&mut entry.orphans);
        }
        orphans.append(&mut state.active.orphans);
        // Everything aborts below, so the driver is not scheduled.
        self.ranges_to_clean.add(orphans);
        self.ranges_to_clean
            .clear(MetadataError::InterruptedDueToReplStateChange {
                collection: self.collection.clone(),
                reason: reason.to_string(),
            });
    }

    /// Whether `range` intersects the active map or any pinned older map
    fn overlaps_in_use_chunk(state: &ManagerState, range: &ChunkRange) -> bool {
        if let Some(active) = state.active.tracker.metadata.as_ref() {
            // The pin count is irrelevant for the active map.
            if active.range_overlaps_chunk(range) {
                return true;
            }
        }
        state.in_use.iter().any(|entry| {
            entry.tracker.usage.load(Ordering::SeqCst) != 0
                && entry
                    .tracker
                    .metadata
                    .as_ref()
                    .map_or(false, |metadata| metadata.range_overlaps_chunk(range))
        })
    }

    /// First anchored deletion overlapping `range`, searching newest first
    fn overlaps_in_use_cleanups(
        state: &ManagerState,
        range: &ChunkRange,
    ) -> Option<CleanupNotification> {
        for deletion in state.active.orphans.iter().rev() {
            if deletion.range.overlaps(range) {
                return Some(deletion.notification.clone());
            }
        }
        for entry in state.in_use.iter().rev() {
            for deletion in entry.orphans.iter().rev() {
                if deletion.range.overlaps(range) {
                    return Some(deletion.notification.clone());
                }
            }
        }
        None
    }
}

/// Diagnostic view of the manager's bookkeeping
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataReport {
    /// Ranges queued for background deletion, head first
    pub ranges_to_clean: Vec<ChunkRange>,
    /// Ranges currently being migrated in
    pub pending_chunks: Vec<ChunkRange>,
    /// Ranges owned by the active chunk map
    pub active_metadata_ranges: Vec<ChunkRange>,
}
