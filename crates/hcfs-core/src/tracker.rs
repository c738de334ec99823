//! In-memory cache usage per inode.
//!
//! Nodes are spread over [`BUCKETS`] independently locked hash maps. Every
//! mutation takes the inode's bucket lock first and the accounting lock
//! second, never the other way round, so the aggregate in [`Accounting`]
//! always equals the sum over all nodes once the bucket lock is released.
//!
//! Callers that change a block apply the matching tracker update while they
//! still hold that inode's ledger lock, so the nodes never lag behind the
//! ledger. The order is ledger lock, bucket lock, accounting lock.
//!
//! The tracker is derived data: [`CacheUsageTracker::rebuild_from`] recreates
//! it from the ledgers.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::accounting::{Accounting, CachePressure, SystemAccounting};
use crate::block_store::BlockStore;
use crate::error::BlockResult;
use crate::ledger::Ledger;
use crate::status::BlockStatus;
use crate::{InodeId, unix_millis};

/// Number of hash buckets.
pub const BUCKETS: usize = 256;

/// Cache usage of one inode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheUsageNode {
    /// Owning inode.
    pub inode: InodeId,
    /// Bytes of local blocks that also exist remotely.
    pub clean_cache_size: u64,
    /// Bytes of local blocks not yet uploaded.
    pub dirty_cache_size: u64,
    /// Block files counted in the two sizes.
    pub blocks: u64,
    /// Last read or write, milliseconds since the Unix epoch.
    pub last_access_ms: u64,
    /// Last write, milliseconds since the Unix epoch.
    pub last_mod_ms: u64,
    /// Transfers currently holding the node.
    pub in_flight: u32,
}

impl CacheUsageNode {
    fn new(inode: InodeId) -> Self {
        Self {
            inode,
            ..Default::default()
        }
    }

    fn is_idle(&self) -> bool {
        self.clean_cache_size == 0 && self.dirty_cache_size == 0 && self.blocks == 0 && self.in_flight == 0
    }
}

/// An inode the reclaimer may evict from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionCandidate {
    /// Inode.
    pub inode: InodeId,
    /// Evictable bytes.
    pub clean_bytes: u64,
    /// Time since last access in milliseconds.
    pub idle_ms: u64,
}

/// Per-inode cache usage plus the global aggregate.
pub struct CacheUsageTracker {
    buckets: Box<[Mutex<HashMap<InodeId, CacheUsageNode>>]>,
    accounting: Arc<Accounting>,
    pressure: Arc<CachePressure>,
    soft_limit: u64,
}

impl std::fmt::Debug for CacheUsageTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheUsageTracker")
            .field("soft_limit", &self.soft_limit)
            .field("aggregate", &self.accounting.snapshot())
            .finish_non_exhaustive()
    }
}

impl CacheUsageTracker {
    /// Create an empty tracker feeding `accounting`.
    ///
    /// `pressure` is signalled whenever the cache grows past `soft_limit` and
    /// notified whenever bytes are released.
    pub fn new(accounting: Arc<Accounting>, pressure: Arc<CachePressure>, soft_limit: u64) -> Self {
        let buckets = (0..BUCKETS).map(|_| Mutex::new(HashMap::new())).collect();
        Self {
            buckets,
            accounting,
            pressure,
            soft_limit,
        }
    }

    fn bucket(&self, inode: InodeId) -> &Mutex<HashMap<InodeId, CacheUsageNode>> {
        // Truncation is fine, only the low bits pick the bucket.
        #[allow(clippy::cast_possible_truncation)]
        let idx = (inode % BUCKETS as u64) as usize;
        &self.buckets[idx]
    }

    /// A block file of `bytes` now exists locally.
    pub fn record_block_materialized(&self, inode: InodeId, bytes: u64, dirty: bool) {
        self.record_block_replaced(inode, None, bytes, dirty);
    }

    /// A block file of `bytes` was removed.
    pub fn record_block_removed(&self, inode: InodeId, bytes: u64, dirty: bool) {
        {
            let mut bucket = self.bucket(inode).lock();
            let node = bucket.entry(inode).or_insert_with(|| CacheUsageNode::new(inode));
            let released = remove_bytes(node, bytes, dirty);
            self.accounting.update(|acct| release(acct, released, dirty));
            if node.is_idle() {
                bucket.remove(&inode);
            }
        }
        self.pressure.notify_space();
    }

    /// A block was rewritten: drop the bytes it held (`old`, with their
    /// dirtiness) and count `bytes` in their place, in one step.
    pub fn record_block_replaced(
        &self,
        inode: InodeId,
        old: Option<(u64, bool)>,
        bytes: u64,
        dirty: bool,
    ) {
        let now = unix_millis();
        let cache_size = {
            let mut bucket = self.bucket(inode).lock();
            let node = bucket.entry(inode).or_insert_with(|| CacheUsageNode::new(inode));
            let released = old.map(|(size, was_dirty)| (remove_bytes(node, size, was_dirty), was_dirty));
            if dirty {
                node.dirty_cache_size += bytes;
                node.last_mod_ms = now;
            } else {
                node.clean_cache_size += bytes;
            }
            node.blocks += 1;
            node.last_access_ms = now;
            self.accounting.update(|acct| {
                if let Some((released, was_dirty)) = released {
                    release(acct, released, was_dirty);
                }
                acct.cache_size += bytes;
                acct.cache_blocks += 1;
                if dirty {
                    acct.dirty_cache_size += bytes;
                }
                acct.cache_size
            })
        };
        if cache_size > self.soft_limit {
            self.pressure.signal();
        }
    }

    /// An upload finished: `bytes` move from dirty to clean.
    pub fn transition_dirty_to_clean(&self, inode: InodeId, bytes: u64) {
        let mut bucket = self.bucket(inode).lock();
        let node = bucket.entry(inode).or_insert_with(|| CacheUsageNode::new(inode));
        let moved = bytes.min(node.dirty_cache_size);
        if moved != bytes {
            warn!(inode, bytes, dirty = node.dirty_cache_size, "Dirty byte count underflow");
        }
        node.dirty_cache_size -= moved;
        node.clean_cache_size += moved;
        self.accounting.update(|acct| {
            acct.dirty_cache_size = acct.dirty_cache_size.saturating_sub(moved);
        });
    }

    /// Mark `inode` as just accessed.
    pub fn touch_access(&self, inode: InodeId) {
        self.touch_access_at(inode, unix_millis());
    }

    /// Set `inode`'s last access time. A node is only created for inodes
    /// that hold cached bytes.
    pub fn touch_access_at(&self, inode: InodeId, at_ms: u64) {
        if let Some(node) = self.bucket(inode).lock().get_mut(&inode) {
            node.last_access_ms = at_ms;
        }
    }

    /// A transfer for `inode` started; keeps the node alive.
    pub fn begin_transfer(&self, inode: InodeId) {
        let mut bucket = self.bucket(inode).lock();
        bucket
            .entry(inode)
            .or_insert_with(|| CacheUsageNode::new(inode))
            .in_flight += 1;
    }

    /// A transfer for `inode` finished.
    pub fn end_transfer(&self, inode: InodeId) {
        let mut bucket = self.bucket(inode).lock();
        if let Some(node) = bucket.get_mut(&inode) {
            node.in_flight = node.in_flight.saturating_sub(1);
            if node.is_idle() {
                bucket.remove(&inode);
            }
        }
    }

    /// Drop `inode`'s node, releasing whatever it still counted.
    pub fn forget(&self, inode: InodeId) -> Option<CacheUsageNode> {
        let mut bucket = self.bucket(inode).lock();
        let node = bucket.remove(&inode)?;
        if node.blocks > 0 || node.clean_cache_size > 0 || node.dirty_cache_size > 0 {
            warn!(inode, clean = node.clean_cache_size, dirty = node.dirty_cache_size, "Forgetting inode that still holds cache");
            self.accounting.update(|acct| {
                acct.cache_size = acct
                    .cache_size
                    .saturating_sub(node.clean_cache_size + node.dirty_cache_size);
                acct.dirty_cache_size = acct.dirty_cache_size.saturating_sub(node.dirty_cache_size);
                acct.cache_blocks = acct.cache_blocks.saturating_sub(node.blocks);
            });
        }
        Some(node)
    }

    /// Copy of `inode`'s node.
    pub fn snapshot(&self, inode: InodeId) -> Option<CacheUsageNode> {
        self.bucket(inode).lock().get(&inode).copied()
    }

    /// Sum over all nodes, for checking the aggregate.
    pub fn totals(&self) -> (u64, u64) {
        self.buckets.iter().fold((0, 0), |(clean, dirty), bucket| {
            bucket.lock().values().fold((clean, dirty), |(c, d), node| {
                (c + node.clean_cache_size, d + node.dirty_cache_size)
            })
        })
    }

    /// Inodes that hold dirty bytes.
    pub fn dirty_inodes(&self) -> Vec<InodeId> {
        let mut inodes: Vec<_> = self
            .buckets
            .iter()
            .flat_map(|bucket| {
                bucket
                    .lock()
                    .values()
                    .filter(|n| n.dirty_cache_size > 0)
                    .map(|n| n.inode)
                    .collect::<Vec<_>>()
            })
            .collect();
        inodes.sort_unstable();
        inodes
    }

    /// Inodes with clean bytes, least recently accessed first, ties by inode.
    pub fn eviction_candidates(&self, now_ms: u64) -> Vec<EvictionCandidate> {
        let mut candidates: Vec<_> = self
            .buckets
            .iter()
            .flat_map(|bucket| {
                bucket
                    .lock()
                    .values()
                    .filter(|n| n.clean_cache_size > 0)
                    .map(|n| EvictionCandidate {
                        inode: n.inode,
                        clean_bytes: n.clean_cache_size,
                        idle_ms: now_ms.saturating_sub(n.last_access_ms),
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        candidates.sort_by(|a, b| b.idle_ms.cmp(&a.idle_ms).then(a.inode.cmp(&b.inode)));
        candidates
    }

    /// Replace all nodes with counts scanned from the ledgers and reconcile
    /// `accounting` with the result.
    pub fn rebuild_from(&self, ledger: &Ledger, store: &BlockStore) -> BlockResult<SystemAccounting> {
        let mut scanned = SystemAccounting::default();
        let mut nodes = Vec::new();
        for inode in ledger.inodes()? {
            let Some(guard) = ledger.try_lock_existing(inode)? else {
                continue;
            };
            scanned.total_inodes += 1;
            let mut node = CacheUsageNode::new(inode);
            for (block, record) in guard.records()? {
                if record.object_version.is_some() {
                    scanned.backend_objects += 1;
                }
                if matches!(record.status, BlockStatus::Both | BlockStatus::Cloud) {
                    scanned.backend_size += record.size;
                }
                let Some(dirty) = record.status.cached() else {
                    continue;
                };
                if !store.exists(inode, block) {
                    warn!(inode, block, status = %record.status, "Cached block has no local file");
                    continue;
                }
                node.blocks += 1;
                node.last_access_ms = node.last_access_ms.max(record.modified_ms);
                if dirty {
                    node.dirty_cache_size += record.size;
                    node.last_mod_ms = node.last_mod_ms.max(record.modified_ms);
                } else {
                    node.clean_cache_size += record.size;
                }
            }
            if node.blocks > 0 {
                nodes.push(node);
            }
        }

        for bucket in self.buckets.iter() {
            bucket.lock().clear();
        }
        for node in nodes {
            scanned.cache_size += node.clean_cache_size + node.dirty_cache_size;
            scanned.dirty_cache_size += node.dirty_cache_size;
            scanned.cache_blocks += node.blocks;
            self.bucket(node.inode).lock().insert(node.inode, node);
        }
        self.accounting.reconcile(scanned);
        debug!(
            inodes = scanned.total_inodes,
            cache_size = scanned.cache_size,
            dirty = scanned.dirty_cache_size,
            "Rebuilt cache usage"
        );
        Ok(scanned)
    }
}

fn remove_bytes(node: &mut CacheUsageNode, bytes: u64, dirty: bool) -> u64 {
    let counter = if dirty {
        &mut node.dirty_cache_size
    } else {
        &mut node.clean_cache_size
    };
    let released = bytes.min(*counter);
    if released != bytes {
        warn!(inode = node.inode, bytes, dirty, "Cache byte count underflow");
    }
    *counter -= released;
    node.blocks = node.blocks.saturating_sub(1);
    released
}

fn release(acct: &mut SystemAccounting, bytes: u64, dirty: bool) {
    acct.cache_size = acct.cache_size.saturating_sub(bytes);
    acct.cache_blocks = acct.cache_blocks.saturating_sub(1);
    if dirty {
        acct.dirty_cache_size = acct.dirty_cache_size.saturating_sub(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn tracker(soft_limit: u64) -> (TempDir, CacheUsageTracker, Arc<Accounting>, Arc<CachePressure>) {
        let tmp = TempDir::new().unwrap();
        let accounting = Arc::new(Accounting::new(tmp.path().join("s.json"), false));
        let pressure = Arc::new(CachePressure::new());
        let tracker = CacheUsageTracker::new(Arc::clone(&accounting), Arc::clone(&pressure), soft_limit);
        (tmp, tracker, accounting, pressure)
    }

    fn assert_aggregate(tracker: &CacheUsageTracker, accounting: &Accounting) {
        let (clean, dirty) = tracker.totals();
        let acct = accounting.snapshot();
        assert_eq!(acct.cache_size, clean + dirty);
        assert_eq!(acct.dirty_cache_size, dirty);
    }

    #[test]
    fn test_materialize_clean_and_remove() {
        let (_tmp, tracker, accounting, _) = tracker(u64::MAX);
        tracker.record_block_materialized(1, 100, true);
        tracker.record_block_materialized(1, 50, false);
        let node = tracker.snapshot(1).unwrap();
        assert_eq!((node.clean_cache_size, node.dirty_cache_size, node.blocks), (50, 100, 2));

        tracker.transition_dirty_to_clean(1, 100);
        assert_eq!(accounting.snapshot().dirty_cache_size, 0);
        assert_eq!(accounting.snapshot().cache_size, 150);

        tracker.record_block_removed(1, 100, false);
        tracker.record_block_removed(1, 50, false);
        assert!(tracker.snapshot(1).is_none(), "idle node must be dropped");
        assert_eq!(accounting.snapshot(), SystemAccounting::default());
    }

    #[test]
    fn test_in_flight_keeps_node() {
        let (_tmp, tracker, _, _) = tracker(u64::MAX);
        tracker.begin_transfer(4);
        tracker.record_block_materialized(4, 10, false);
        tracker.record_block_removed(4, 10, false);
        assert!(tracker.snapshot(4).is_some());
        tracker.end_transfer(4);
        assert!(tracker.snapshot(4).is_none());
    }

    #[test]
    fn test_replace_is_single_step() {
        let (_tmp, tracker, accounting, _) = tracker(u64::MAX);
        tracker.record_block_materialized(2, 40, false);
        tracker.record_block_replaced(2, Some((40, false)), 60, true);
        let acct = accounting.snapshot();
        assert_eq!((acct.cache_size, acct.cache_blocks, acct.dirty_cache_size), (60, 1, 60));
        assert_eq!(tracker.dirty_inodes(), vec![2]);
    }

    #[test]
    fn test_soft_limit_signals_pressure() {
        let (_tmp, tracker, _, pressure) = tracker(100);
        tracker.record_block_materialized(1, 100, true);
        assert!(!pressure.wait_for_pressure(std::time::Duration::ZERO));
        tracker.record_block_materialized(1, 1, true);
        assert!(pressure.wait_for_pressure(std::time::Duration::ZERO));
    }

    #[test]
    fn test_candidates_oldest_first() {
        let (_tmp, tracker, _, _) = tracker(u64::MAX);
        for inode in 1..=4 {
            tracker.record_block_materialized(inode, 10, false);
        }
        tracker.record_block_materialized(5, 10, true);
        tracker.touch_access_at(1, 300);
        tracker.touch_access_at(2, 100);
        tracker.touch_access_at(3, 100);
        tracker.touch_access_at(4, 200);

        let order: Vec<_> = tracker.eviction_candidates(1000).iter().map(|c| c.inode).collect();
        assert_eq!(order, vec![2, 3, 4, 1], "dirty-only inode 5 is not a candidate");
    }

    #[derive(Debug, Clone)]
    enum Op {
        Materialize(u64, u64, bool),
        Remove(u64, u64, bool),
        Clean(u64, u64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..8u64, 0..1000u64, any::<bool>()).prop_map(|(i, b, d)| Op::Materialize(i, b, d)),
            (0..8u64, 0..1000u64, any::<bool>()).prop_map(|(i, b, d)| Op::Remove(i, b, d)),
            (0..8u64, 0..1000u64).prop_map(|(i, b)| Op::Clean(i, b)),
        ]
    }

    proptest! {
        #[test]
        fn prop_aggregate_matches_nodes(ops in proptest::collection::vec(op(), 0..64)) {
            let (_tmp, tracker, accounting, _) = tracker(u64::MAX);
            for op in ops {
                match op {
                    Op::Materialize(i, b, d) => tracker.record_block_materialized(i, b, d),
                    Op::Remove(i, b, d) => tracker.record_block_removed(i, b, d),
                    Op::Clean(i, b) => tracker.transition_dirty_to_clean(i, b),
                }
            }
            assert_aggregate(&tracker, &accounting);
        }
    }
}
