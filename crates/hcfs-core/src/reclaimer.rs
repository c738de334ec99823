//! Cache reclaimer: evicts clean blocks until the cache is back under the
//! soft limit.
//!
//! Only `Both` blocks are ever evicted. Their remote copy is current, so
//! dropping the local file and marking the record `Cloud` loses nothing.
//! Dirty, transient and pinned data is never touched; when only such data is
//! left above the hard limit, the reclaimer flags exhaustion and asks the
//! sync scheduler to upload dirty inodes so they become evictable.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::accounting::{Accounting, CachePressure};
use crate::block_store::BlockStore;
use crate::error::{BlockError, BlockResult};
use crate::ledger::Ledger;
use crate::status::BlockStatus;
use crate::sync::SyncScheduler;
use crate::tracker::CacheUsageTracker;
use crate::{InodeId, unix_millis};

/// Result of one reclaim pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimReport {
    /// Blocks moved from `Both` to `Cloud`.
    pub evicted_blocks: u64,
    /// Bytes released by those evictions.
    pub freed_bytes: u64,
    /// Blocks whose eviction failed and was skipped.
    pub skipped: u64,
    /// Candidate inodes passed over because they are pinned.
    pub pinned: u64,
    /// The cache is still above the hard limit with nothing left to evict.
    pub exhausted: bool,
}

/// Soft/hard limit enforcement over the tracker's candidate ordering.
pub struct CacheReclaimer {
    ledger: Arc<Ledger>,
    store: BlockStore,
    tracker: Arc<CacheUsageTracker>,
    accounting: Arc<Accounting>,
    pressure: Arc<CachePressure>,
    sync: Arc<SyncScheduler>,
    soft_limit: u64,
    hard_limit: u64,
    interval: Duration,
    pass: Mutex<()>,
    stop: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for CacheReclaimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheReclaimer")
            .field("soft_limit", &self.soft_limit)
            .field("hard_limit", &self.hard_limit)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl CacheReclaimer {
    /// Create a reclaimer. Call [`start`](Self::start) to run it in the
    /// background.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: Arc<Ledger>,
        store: BlockStore,
        tracker: Arc<CacheUsageTracker>,
        accounting: Arc<Accounting>,
        pressure: Arc<CachePressure>,
        sync: Arc<SyncScheduler>,
        limits: (u64, u64),
        interval: Duration,
    ) -> Self {
        let (soft_limit, hard_limit) = limits;
        Self {
            ledger,
            store,
            tracker,
            accounting,
            pressure,
            sync,
            soft_limit,
            hard_limit,
            interval,
            pass: Mutex::new(()),
            stop: AtomicBool::new(false),
            thread: Mutex::new(None),
        }
    }

    /// Run one reclaim pass.
    ///
    /// Candidates are visited least recently accessed first; within an
    /// inode, blocks are evicted in ledger order. The pass stops as soon as
    /// the cache is at or below the soft limit. Passes are serialized, and a
    /// second pass over unchanged state evicts nothing.
    pub fn run_once(&self) -> BlockResult<ReclaimReport> {
        let _pass = self.pass.lock();
        let mut report = ReclaimReport::default();

        for candidate in self.tracker.eviction_candidates(unix_millis()) {
            let excess = self.excess();
            if excess == 0 {
                break;
            }
            self.evict_inode(candidate.inode, excess, &mut report)?;
        }

        let acct = self.accounting.snapshot();
        if acct.cache_size > self.soft_limit {
            let dirty = self.tracker.dirty_inodes();
            if !dirty.is_empty() {
                debug!(inodes = dirty.len(), "Flushing dirty inodes to make them evictable");
                self.sync.flush(dirty);
            }
        }
        report.exhausted = acct.cache_size > self.hard_limit;
        self.pressure.set_exhausted(report.exhausted);
        if report.exhausted {
            let e = BlockError::CapacityExhausted {
                cache_size: acct.cache_size,
                hard_limit: self.hard_limit,
            };
            warn!(error = %e, dirty_bytes = acct.dirty_cache_size, "No evictable data left");
        } else {
            self.pressure.notify_space();
        }

        if report.evicted_blocks > 0 {
            info!(
                evicted = report.evicted_blocks,
                freed_bytes = report.freed_bytes,
                cache_size = acct.cache_size,
                "Reclaim pass finished"
            );
        }
        Ok(report)
    }

    fn excess(&self) -> u64 {
        self.accounting
            .snapshot()
            .cache_size
            .saturating_sub(self.soft_limit)
    }

    /// Evict `Both` blocks of one inode until `excess` bytes are freed.
    ///
    /// Each record is marked `Cloud` before its file goes, and restored if
    /// the file cannot be removed. The tracker follows under the same lock.
    fn evict_inode(&self, inode: InodeId, excess: u64, report: &mut ReclaimReport) -> BlockResult<()> {
        let Some(mut guard) = self.ledger.try_lock_existing(inode)? else {
            return Ok(());
        };
        if guard.header().is_pinned() {
            report.pinned += 1;
            return Ok(());
        }

        let mut freed = 0;
        for (block, record) in guard.records()? {
            if freed >= excess {
                break;
            }
            if record.status != BlockStatus::Both {
                continue;
            }
            if let Err(e) = guard.transition(block, |r| r.status = BlockStatus::Cloud) {
                warn!(inode, block, error = %e, "Could not mark block cloud, skipping");
                report.skipped += 1;
                continue;
            }
            match self.store.remove(inode, block) {
                Ok(true) => {}
                Ok(false) => warn!(inode, block, "Block file already gone, marked cloud"),
                Err(e) => {
                    warn!(inode, block, error = %e, "Could not evict block, skipping");
                    report.skipped += 1;
                    if let Err(e) = guard.set_record(block, record) {
                        // The ledger says cloud with a stray file; recovery
                        // removes the file.
                        error!(inode, block, error = %e, "Could not restore block record");
                    }
                    continue;
                }
            }
            self.tracker.record_block_removed(inode, record.size, false);
            debug!(inode, block, bytes = record.size, "Evicted block");
            freed += record.size;
            report.evicted_blocks += 1;
            report.freed_bytes += record.size;
        }
        Ok(())
    }

    /// Start the background loop. It wakes on cache pressure or every
    /// reclaim interval.
    pub fn start(self: &Arc<Self>) {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return;
        }
        let reclaimer = Arc::clone(self);
        *thread = Some(
            thread::Builder::new()
                .name("hcfs-reclaimer".into())
                .spawn(move || reclaimer.run_loop())
                .expect("failed to spawn reclaimer thread"),
        );
    }

    fn run_loop(&self) {
        info!(soft_limit = self.soft_limit, hard_limit = self.hard_limit, "Cache reclaimer started");
        while !self.stop.load(Ordering::Acquire) {
            self.pressure.wait_for_pressure(self.interval);
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            if self.excess() == 0 && !self.pressure.is_exhausted() {
                continue;
            }
            if let Err(e) = self.run_once() {
                warn!(error = %e, "Reclaim pass failed");
            }
        }
        info!("Cache reclaimer stopped");
    }

    /// Stop the background loop and wait for it.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.pressure.signal();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}
