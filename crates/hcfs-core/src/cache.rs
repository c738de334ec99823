//! The block cache facade used by the filesystem layer.
//!
//! [`BlockCache::open`] builds every component from a [`HcfsConfig`], runs
//! crash recovery over the existing meta files, rebuilds the cache usage
//! counters and starts the background threads. There are no globals: each
//! component receives the handles it needs at construction.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::accounting::{Accounting, AccountingFlusher, CachePressure, SystemAccounting};
use crate::backend::ObjectBackend;
use crate::block_store::BlockStore;
use crate::config::HcfsConfig;
use crate::error::{BlockError, BlockResult};
use crate::layout::{HashedLayout, PathResolver};
use crate::ledger::{Ledger, LedgerGuard};
use crate::reclaimer::{CacheReclaimer, ReclaimReport};
use crate::status::{BlockRecord, BlockStatus};
use crate::sync::SyncScheduler;
use crate::tracker::CacheUsageTracker;
use crate::transfer::TransferEngine;
use crate::worker::WorkerPool;
use crate::{BlockIndex, InodeId, unix_millis};

/// Reads re-check the ledger this many times when the block keeps moving
/// between states underneath them.
const MAX_READ_ATTEMPTS: usize = 4;

/// Whether a block in `status` contributes to `backend_size`.
fn counts_backend_size(status: BlockStatus) -> bool {
    matches!(
        status,
        BlockStatus::Both | BlockStatus::Cloud | BlockStatus::CloudToLocal
    )
}

/// Recovery figures gathered by [`BlockCache::open`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OpenReport {
    /// Meta files scanned.
    pub inodes: usize,
    /// Inodes whose ledger recovery had to change.
    pub recovered_inodes: usize,
    /// Possibly partial remote objects removed.
    pub cleanup_deletes: usize,
    /// Inodes handed to the sync scheduler at startup.
    pub dirty_inodes: usize,
}

/// Block lifecycle engine: local cache, ledger and backend transfers.
pub struct BlockCache {
    config: HcfsConfig,
    ledger: Arc<Ledger>,
    store: BlockStore,
    accounting: Arc<Accounting>,
    pressure: Arc<CachePressure>,
    tracker: Arc<CacheUsageTracker>,
    engine: Arc<TransferEngine>,
    upload_workers: Arc<WorkerPool>,
    download_workers: Arc<WorkerPool>,
    delete_workers: Arc<WorkerPool>,
    sync: Arc<SyncScheduler>,
    reclaimer: Arc<CacheReclaimer>,
    flusher: Mutex<Option<AccountingFlusher>>,
    open_report: OpenReport,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCache")
            .field("accounting", &self.accounting.snapshot())
            .field("engine", &self.engine)
            .field("shut_down", &self.shut_down.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl BlockCache {
    /// Open the cache described by `config` on top of `backend`.
    ///
    /// Recovery runs before any background thread starts: transient ledger
    /// states are folded back, possibly partial uploads are deleted, and the
    /// usage counters are rebuilt from the ledgers.
    pub fn open(config: HcfsConfig, backend: Arc<dyn ObjectBackend>) -> BlockResult<Arc<Self>> {
        config.validate()?;
        let fsync = config.cache.fsync;
        let layout = Arc::new(HashedLayout::new(
            &config.paths.meta_dir,
            &config.paths.block_dir,
            config.paths.subdirs,
        ));
        layout
            .ensure_dirs()
            .map_err(|e| BlockError::local_io("creating cache directories", e))?;
        let resolver: Arc<dyn PathResolver> = layout;

        let ledger = Arc::new(Ledger::new(Arc::clone(&resolver), fsync));
        let store = BlockStore::new(resolver, fsync);
        let accounting = Arc::new(Accounting::load(&config.paths.system_data, fsync)?);
        let pressure = Arc::new(CachePressure::new());
        let tracker = Arc::new(CacheUsageTracker::new(
            Arc::clone(&accounting),
            Arc::clone(&pressure),
            config.cache.soft_limit,
        ));
        let engine = Arc::new(TransferEngine::new(
            Arc::clone(&ledger),
            store.clone(),
            Arc::clone(&tracker),
            Arc::clone(&accounting),
            backend,
            &config,
        ));

        let mut open_report = OpenReport::default();
        let mut dirty = Vec::new();
        let mut cleanup = Vec::new();
        for inode in ledger.inodes()? {
            open_report.inodes += 1;
            let report = ledger.normalize(inode, &store)?;
            if !report.is_clean() {
                open_report.recovered_inodes += 1;
                info!(
                    inode,
                    reverted_uploads = report.reverted_uploads,
                    reverted_downloads = report.reverted_downloads,
                    lost_local = report.lost_local,
                    stray_files = report.stray_files_removed,
                    "Recovered inode ledger"
                );
            }
            if report.needs_sync {
                dirty.push(inode);
            }
            cleanup.extend(report.cleanup_deletes.into_iter().map(|block| (inode, block)));
        }
        for (inode, block) in cleanup {
            match engine.delete_remote(inode, block) {
                Ok(()) => open_report.cleanup_deletes += 1,
                Err(e) => warn!(inode, block, error = %e, "Could not remove partial upload"),
            }
        }
        let rebuilt = tracker.rebuild_from(&ledger, &store)?;
        open_report.dirty_inodes = dirty.len();

        let transfer = &config.transfer;
        let upload_workers = Arc::new(WorkerPool::new(
            "upload",
            transfer.upload_concurrency,
            transfer.queue_capacity,
        ));
        let download_workers = Arc::new(WorkerPool::new(
            "download",
            transfer.download_concurrency,
            transfer.queue_capacity,
        ));
        let delete_workers = Arc::new(WorkerPool::new(
            "delete",
            transfer.delete_concurrency,
            transfer.queue_capacity,
        ));
        let sync = Arc::new(SyncScheduler::new(
            Arc::clone(&engine),
            Arc::clone(&ledger),
            Arc::clone(&tracker),
            Arc::clone(&accounting),
            Arc::clone(&upload_workers),
            Arc::clone(&delete_workers),
            &config,
        ));
        let reclaimer = Arc::new(CacheReclaimer::new(
            Arc::clone(&ledger),
            store.clone(),
            Arc::clone(&tracker),
            Arc::clone(&accounting),
            Arc::clone(&pressure),
            Arc::clone(&sync),
            (config.cache.soft_limit, config.cache.hard_limit),
            config.cache.reclaim_interval,
        ));
        reclaimer.start();
        let flusher = accounting.spawn_flusher(config.accounting.flush_interval);

        for &inode in &dirty {
            sync.mark_dirty(inode);
        }
        if rebuilt.cache_size > config.cache.soft_limit {
            pressure.signal();
        }

        info!(
            inodes = open_report.inodes,
            recovered = open_report.recovered_inodes,
            dirty = open_report.dirty_inodes,
            cache_size = rebuilt.cache_size,
            dirty_bytes = rebuilt.dirty_cache_size,
            "Block cache opened"
        );

        Ok(Arc::new(Self {
            config,
            ledger,
            store,
            accounting,
            pressure,
            tracker,
            engine,
            upload_workers,
            download_workers,
            delete_workers,
            sync,
            reclaimer,
            flusher: Mutex::new(Some(flusher)),
            open_report,
            shut_down: AtomicBool::new(false),
        }))
    }

    fn ensure_running(&self) -> BlockResult<()> {
        if self.shut_down.load(Ordering::Acquire) {
            Err(BlockError::ShutDown)
        } else {
            Ok(())
        }
    }

    /// Read the whole block, downloading it first if only the remote copy
    /// exists.
    ///
    /// A vacant or deleted block reads as empty.
    pub fn read_block(&self, inode: InodeId, block: BlockIndex) -> BlockResult<Bytes> {
        self.ensure_running()?;
        for _ in 0..MAX_READ_ATTEMPTS {
            let status = {
                let Some(guard) = self.ledger.try_lock_existing(inode)? else {
                    return Ok(Bytes::new());
                };
                let record = guard.record(block)?;
                match record.status {
                    BlockStatus::Local | BlockStatus::Both | BlockStatus::LocalToCloud => {
                        let data = self.store.read(inode, block)?;
                        drop(guard);
                        self.tracker.touch_access(inode);
                        return Ok(data);
                    }
                    status => status,
                }
            };
            match status {
                BlockStatus::None | BlockStatus::Deleted => return Ok(Bytes::new()),
                _ => self.engine.fetch_from_cloud(inode, block)?,
            }
        }
        Err(BlockError::consistency(
            inode,
            block,
            "block kept changing state during read",
        ))
    }

    /// Bytes of cache a write of `size` bytes would add.
    fn write_growth(&self, inode: InodeId, block: BlockIndex, size: u64) -> BlockResult<u64> {
        let current = match self.ledger.try_lock_existing(inode)? {
            Some(guard) => {
                let record = guard.record(block)?;
                if record.status.cached().is_some() { record.size } else { 0 }
            }
            None => 0,
        };
        Ok(size.saturating_sub(current))
    }

    /// Wait for room under the hard limit.
    fn admit(&self, growth: u64) -> BlockResult<()> {
        if growth == 0 {
            return Ok(());
        }
        let hard_limit = self.config.cache.hard_limit;
        let fits = || self.accounting.snapshot().cache_size + growth <= hard_limit;
        if fits() {
            return Ok(());
        }
        debug!(growth, hard_limit, "Write waiting for cache space");
        self.pressure.signal();
        if self.pressure.wait_for_space(self.config.cache.hard_limit_wait, fits) {
            return Ok(());
        }
        if self.pressure.is_closed() {
            return Err(BlockError::ShutDown);
        }
        Err(BlockError::CapacityExhausted {
            cache_size: self.accounting.snapshot().cache_size,
            hard_limit,
        })
    }

    /// Replace the contents of a block and mark it dirty.
    ///
    /// The write is accepted once it is on local disk; the upload happens on
    /// the next sync pass. When the cache is at the hard limit the caller
    /// waits up to `cache.hard_limit_wait` for the reclaimer before getting
    /// [`BlockError::CapacityExhausted`].
    pub fn write_block(&self, inode: InodeId, block: BlockIndex, data: &[u8]) -> BlockResult<()> {
        self.ensure_running()?;
        let max = self.config.cache.block_size;
        if data.len() > max {
            return Err(BlockError::BlockTooLarge {
                size: data.len(),
                max,
            });
        }
        let size = data.len() as u64;
        self.admit(self.write_growth(inode, block, size)?)?;

        {
            let mut guard = self.ledger.lock(inode)?;
            let prior = guard.record(block)?;
            self.store.write(inode, block, data)?;
            let previous = guard.transition(block, |r| {
                *r = BlockRecord::local(size, prior.object_version, unix_millis());
            })?;

            let old = previous.status.cached().map(|dirty| (previous.size, dirty));
            self.tracker.record_block_replaced(inode, old, size, true);
            let stale_remote = counts_backend_size(previous.status);
            let created = guard.created();
            if stale_remote || created {
                self.accounting.update(|acct| {
                    if stale_remote {
                        acct.backend_size = acct.backend_size.saturating_sub(previous.size);
                    }
                    if created {
                        acct.total_inodes += 1;
                    }
                });
            }
        }
        self.sync.mark_dirty(inode);
        Ok(())
    }

    /// Delete one block under its inode lock. Returns whether a remote
    /// object is left for the next sync pass.
    fn delete_locked(&self, guard: &mut LedgerGuard<'_>, block: BlockIndex) -> BlockResult<bool> {
        let inode = guard.inode();
        let record = guard.record(block)?;
        if !record.status.is_live() {
            return Ok(false);
        }
        if record.status.has_local_copy() {
            self.store.remove(inode, block)?;
        }
        let pending_remote = record.has_remote_object();
        if pending_remote {
            guard.transition(block, |r| {
                r.status = BlockStatus::Deleted;
                r.prior = BlockStatus::None;
            })?;
        } else {
            guard.purge(block)?;
        }
        if let Some(dirty) = record.status.cached() {
            self.tracker.record_block_removed(inode, record.size, dirty);
        }
        if counts_backend_size(record.status) {
            self.accounting.update(|acct| {
                acct.backend_size = acct.backend_size.saturating_sub(record.size);
            });
        }
        Ok(pending_remote)
    }

    /// Remove a block. Its remote object, if any, is deleted by the next
    /// sync pass; a block that never reached the backend is purged at once.
    pub fn delete_block(&self, inode: InodeId, block: BlockIndex) -> BlockResult<()> {
        self.ensure_running()?;
        let pending_remote = {
            let Some(mut guard) = self.ledger.try_lock_existing(inode)? else {
                return Ok(());
            };
            self.delete_locked(&mut guard, block)?
        };
        if pending_remote {
            self.sync.mark_dirty(inode);
        }
        Ok(())
    }

    /// Remove every block of an inode and drop its meta file once the
    /// backend side is clean.
    pub fn delete_inode(&self, inode: InodeId) -> BlockResult<()> {
        self.ensure_running()?;
        {
            let Some(mut guard) = self.ledger.try_lock_existing(inode)? else {
                return Ok(());
            };
            for (block, _) in guard.records()? {
                self.delete_locked(&mut guard, block)?;
            }
            guard.mark_unlinked()?;
        }
        self.sync.mark_dirty(inode);
        debug!(inode, "Inode unlinked");
        Ok(())
    }

    /// Upload every dirty block of `inode` and apply its pending deletes,
    /// waiting for the result.
    pub fn sync_inode(&self, inode: InodeId) -> BlockResult<()> {
        self.ensure_running()?;
        self.sync.sync_now(inode)
    }

    /// Exempt an inode from eviction, or make it evictable again.
    pub fn set_pinned(&self, inode: InodeId, pinned: bool) -> BlockResult<()> {
        self.ensure_running()?;
        let created = {
            let mut guard = self.ledger.lock(inode)?;
            guard.set_pinned(pinned)?;
            guard.created()
        };
        if created {
            self.accounting.update(|acct| acct.total_inodes += 1);
        }
        Ok(())
    }

    /// Current status of a block.
    pub fn block_status(&self, inode: InodeId, block: BlockIndex) -> BlockResult<BlockStatus> {
        match self.ledger.try_lock_existing(inode)? {
            Some(guard) => Ok(guard.record(block)?.status),
            None => Ok(BlockStatus::None),
        }
    }

    /// Start downloading a cloud-only block in the background.
    ///
    /// Returns whether a download was queued.
    pub fn prefetch(&self, inode: InodeId, block: BlockIndex) -> BlockResult<bool> {
        self.ensure_running()?;
        if self.block_status(inode, block)? != BlockStatus::Cloud {
            return Ok(false);
        }
        let engine = Arc::clone(&self.engine);
        self.download_workers
            .submit(move || {
                if let Err(e) = engine.fetch_from_cloud(inode, block) {
                    warn!(inode, block, error = %e, "Prefetch failed");
                }
            })
            .map_err(|_| BlockError::ShutDown)?;
        Ok(true)
    }

    /// Run a reclaim pass now.
    pub fn reclaim_now(&self) -> BlockResult<ReclaimReport> {
        self.ensure_running()?;
        self.reclaimer.run_once()
    }

    /// Current system counters.
    pub fn accounting(&self) -> SystemAccounting {
        self.accounting.snapshot()
    }

    /// Cache usage tracker.
    pub fn tracker(&self) -> &CacheUsageTracker {
        &self.tracker
    }

    /// Ledger over the meta files.
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Local block files.
    pub fn store(&self) -> &BlockStore {
        &self.store
    }

    /// Transfer engine.
    pub fn engine(&self) -> &TransferEngine {
        &self.engine
    }

    /// Sync scheduler.
    pub fn scheduler(&self) -> &SyncScheduler {
        &self.sync
    }

    /// Configuration the cache was opened with.
    pub fn config(&self) -> &HcfsConfig {
        &self.config
    }

    /// What recovery found at open.
    pub fn open_report(&self) -> OpenReport {
        self.open_report
    }

    /// Stop all background work and persist the accounting.
    ///
    /// In-flight transfers and sync passes finish first so no transient
    /// ledger state is left behind. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down block cache");
        self.reclaimer.stop();
        self.sync.shutdown();
        for pool in [&self.upload_workers, &self.download_workers, &self.delete_workers] {
            pool.shutdown();
        }
        for pool in [&self.upload_workers, &self.download_workers, &self.delete_workers] {
            pool.join();
        }
        self.pressure.close();
        if let Some(flusher) = self.flusher.lock().take()
            && let Err(e) = flusher.stop()
        {
            warn!(error = %e, "Final accounting flush failed");
        }
        info!("Block cache stopped");
    }
}

impl Drop for BlockCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}
