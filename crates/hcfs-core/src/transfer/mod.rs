//! Transfer engine: moves block bytes between the block store and the
//! backend.
//!
//! Upload, download and delete each draw connections from their own bounded
//! [`TransferPool`]. A remote request runs inside [`TransferEngine::run_with_retry`],
//! which classifies each status, backs off on transient failures,
//! reauthenticates once on an expired session and gives up with a typed
//! error once the budget is spent.
//!
//! Ledger locks are never held across a remote request. Each path commits
//! the transient state, drops the lock, talks to the backend, then relocks
//! and reconciles with whatever happened to the record in the meantime.

mod delete;
mod download;
mod upload;

pub use delete::DeleteOutcome;
pub use upload::UploadOutcome;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use tracing::{debug, error, warn};

use crate::accounting::Accounting;
use crate::backend::{BackendConnection, ObjectBackend, ObjectId, Operation, StatusClass, StatusCode};
use crate::block_store::BlockStore;
use crate::config::HcfsConfig;
use crate::error::{BlockError, BlockResult};
use crate::ledger::Ledger;
use crate::pool::{TransferKind, TransferPool};
use crate::retry::{RetryPolicy, Step};
use crate::status::{BlockRecord, BlockStatus};
use crate::tracker::CacheUsageTracker;
use crate::{BlockIndex, InodeId};

use download::InFlightDownloads;

/// Counters of the transfer engine.
#[derive(Debug, Default)]
pub struct TransferStats {
    /// Acknowledged block uploads.
    pub uploads: AtomicU64,
    /// Block uploads that gave up.
    pub upload_failures: AtomicU64,
    /// Completed block downloads.
    pub downloads: AtomicU64,
    /// Block downloads that gave up.
    pub download_failures: AtomicU64,
    /// Confirmed remote deletes.
    pub deletes: AtomicU64,
    /// Remote deletes that gave up.
    pub delete_failures: AtomicU64,
    /// Attempts repeated after a transient failure.
    pub retries: AtomicU64,
    /// Sessions renewed after an expired-auth response.
    pub reauthentications: AtomicU64,
    /// Readers that joined a download already in flight.
    pub shared_downloads: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Succeeds when `status` counts as success for `op`.
pub(crate) fn check(status: StatusCode, op: Operation) -> Result<(), StatusCode> {
    match status.classify(op) {
        StatusClass::Success => Ok(()),
        _ => Err(status),
    }
}

fn status_error(id: &ObjectId, op: Operation, status: StatusCode) -> BlockError {
    let object = id.to_string();
    match status.classify(op) {
        StatusClass::AuthExpired => BlockError::AuthExpired { object },
        StatusClass::Transient => BlockError::TransientBackend { object, status },
        StatusClass::Permanent | StatusClass::Success => BlockError::PermanentBackend { object, status },
    }
}

/// A block held in a transient state for the length of one transfer.
///
/// Dropping the window ends the tracker transfer. If the transfer unwound
/// before [`TransferWindow::close`], the record is folded back the way
/// crash recovery would: an upload returns to `Local` and keeps a version
/// marker for the object it may have written, a download returns to `Cloud`
/// and its staging file is removed.
pub(crate) struct TransferWindow<'a> {
    engine: &'a TransferEngine,
    inode: InodeId,
    block: BlockIndex,
    transient: BlockStatus,
    closed: bool,
}

impl<'a> TransferWindow<'a> {
    fn open(engine: &'a TransferEngine, inode: InodeId, block: BlockIndex, transient: BlockStatus) -> Self {
        engine.tracker.begin_transfer(inode);
        Self {
            engine,
            inode,
            block,
            transient,
            closed: false,
        }
    }

    fn close(mut self) {
        self.closed = true;
    }

    fn unwind(&self) -> BlockResult<()> {
        let (inode, block) = (self.inode, self.block);
        let Some(mut guard) = self.engine.ledger.try_lock_existing(inode)? else {
            return Ok(());
        };
        let record = guard.record(block)?;
        if record.status != self.transient {
            return Ok(());
        }
        let restored = if self.transient == BlockStatus::CloudToLocal {
            self.engine.store.discard_staged(inode, block)?;
            BlockRecord {
                status: BlockStatus::Cloud,
                prior: BlockStatus::None,
                ..record
            }
        } else {
            BlockRecord {
                status: BlockStatus::Local,
                prior: BlockStatus::None,
                object_version: Some(record.object_version.unwrap_or_else(|| record.next_object_version())),
                ..record
            }
        };
        guard.set_record(block, restored)?;
        if record.object_version.is_none() && restored.object_version.is_some() {
            self.engine.accounting.update(|acct| acct.backend_objects += 1);
        }
        warn!(inode, block, from = %record.status, to = %restored.status, "Transfer aborted, block restored");
        Ok(())
    }
}

impl Drop for TransferWindow<'_> {
    fn drop(&mut self) {
        if !self.closed
            && let Err(e) = self.unwind()
        {
            error!(inode = self.inode, block = self.block, error = %e, "Could not restore aborted transfer");
        }
        self.engine.tracker.end_transfer(self.inode);
    }
}

/// Upload, download and delete paths over shared pools.
pub struct TransferEngine {
    ledger: Arc<Ledger>,
    store: BlockStore,
    tracker: Arc<CacheUsageTracker>,
    accounting: Arc<Accounting>,
    upload_pool: TransferPool,
    download_pool: TransferPool,
    delete_pool: TransferPool,
    retry: RetryPolicy,
    downloads: InFlightDownloads,
    stats: TransferStats,
}

impl std::fmt::Debug for TransferEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferEngine")
            .field("upload_pool", &self.upload_pool)
            .field("download_pool", &self.download_pool)
            .field("delete_pool", &self.delete_pool)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl TransferEngine {
    /// Build the engine and its three connection pools.
    pub fn new(
        ledger: Arc<Ledger>,
        store: BlockStore,
        tracker: Arc<CacheUsageTracker>,
        accounting: Arc<Accounting>,
        backend: Arc<dyn ObjectBackend>,
        config: &HcfsConfig,
    ) -> Self {
        let transfer = &config.transfer;
        Self {
            ledger,
            store,
            tracker,
            accounting,
            upload_pool: TransferPool::new("upload", Arc::clone(&backend), transfer.upload_concurrency),
            download_pool: TransferPool::new(
                "download",
                Arc::clone(&backend),
                transfer.download_concurrency,
            ),
            delete_pool: TransferPool::new("delete", backend, transfer.delete_concurrency),
            retry: RetryPolicy::from_config(&config.retry),
            downloads: InFlightDownloads::default(),
            stats: TransferStats::default(),
        }
    }

    /// Engine counters.
    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    /// Active transfers of `inode` across all pools.
    pub fn in_flight_for(&self, inode: InodeId) -> usize {
        self.upload_pool.in_flight_for(inode)
            + self.download_pool.in_flight_for(inode)
            + self.delete_pool.in_flight_for(inode)
    }

    /// The upload, download and delete pools.
    pub fn pools(&self) -> [&TransferPool; 3] {
        [&self.upload_pool, &self.download_pool, &self.delete_pool]
    }

    /// Run `attempt` against a pooled connection until it succeeds or the
    /// retry budget is spent.
    ///
    /// `attempt` returns the failing status; classification and backoff are
    /// handled here.
    pub(crate) fn run_with_retry<T>(
        &self,
        pool: &TransferPool,
        id: ObjectId,
        op: Operation,
        kind: TransferKind,
        mut attempt: impl FnMut(&mut dyn BackendConnection) -> Result<T, StatusCode>,
    ) -> BlockResult<T> {
        let (inode, block) = match id {
            ObjectId::Block { inode, block } => (inode, block),
            ObjectId::Meta { inode } => (inode, 0),
        };
        let mut backoff = self.retry.backoff();
        loop {
            let err = match pool.acquire(inode, block, kind) {
                Err(e) => BlockError::Connect(e),
                Ok(mut conn) => {
                    let status = match attempt(&mut *conn) {
                        Ok(value) => return Ok(value),
                        Err(status) => status,
                    };
                    let err = status_error(&id, op, status);
                    match backoff.on_failure(&err) {
                        Step::Reauthenticate => {
                            bump(&self.stats.reauthentications);
                            warn!(object = %id, %op, "Backend session expired, reauthenticating");
                            if let Err(e) = conn.reauthenticate() {
                                conn.discard();
                                return Err(BlockError::Connect(e));
                            }
                            continue;
                        }
                        Step::RetryAfter(delay) => {
                            conn.discard();
                            drop(conn);
                            self.wait_before_retry(&id, op, backoff.attempt(), &err, delay);
                            continue;
                        }
                        Step::GiveUp => return Err(err),
                    }
                }
            };
            match backoff.on_failure(&err) {
                Step::RetryAfter(delay) => self.wait_before_retry(&id, op, backoff.attempt(), &err, delay),
                Step::Reauthenticate | Step::GiveUp => return Err(err),
            }
        }
    }

    fn wait_before_retry(
        &self,
        id: &ObjectId,
        op: Operation,
        attempt: u32,
        err: &BlockError,
        delay: std::time::Duration,
    ) {
        bump(&self.stats.retries);
        warn!(
            object = %id,
            %op,
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "Transient backend failure, retrying"
        );
        thread::sleep(delay);
    }

    /// Remove the remote object of a block. A missing object counts as
    /// removed.
    pub(crate) fn delete_remote(&self, inode: InodeId, block: BlockIndex) -> BlockResult<()> {
        let id = ObjectId::Block { inode, block };
        self.run_with_retry(&self.delete_pool, id, Operation::Delete, TransferKind::Delete, |conn| {
            check(conn.delete_object(&id), Operation::Delete)
        })
    }

    /// Upload a snapshot of `inode`'s meta file as `meta_<inode>`.
    pub fn upload_meta(&self, inode: InodeId) -> BlockResult<bool> {
        let snapshot = match self.ledger.try_lock_existing(inode)? {
            Some(guard) => guard.snapshot()?,
            None => return Ok(false),
        };
        let id = ObjectId::Meta { inode };
        self.run_with_retry(&self.upload_pool, id, Operation::Put, TransferKind::Meta, |conn| {
            check(conn.put_object(&id, &snapshot), Operation::Put)
        })?;
        debug!(inode, bytes = snapshot.len(), "Uploaded meta snapshot");
        Ok(true)
    }

    /// Remove `meta_<inode>` from the backend.
    pub fn delete_meta(&self, inode: InodeId) -> BlockResult<()> {
        let id = ObjectId::Meta { inode };
        self.run_with_retry(&self.delete_pool, id, Operation::Delete, TransferKind::Meta, |conn| {
            check(conn.delete_object(&id), Operation::Delete)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU64;
    use std::time::Duration;

    use bytes::Bytes;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    use super::*;
    use crate::accounting::CachePressure;
    use crate::backend::{BackendError, MemoryBackend};
    use crate::layout::{HashedLayout, PathResolver};
    use crate::status::{BlockRecord, BlockStatus};

    type Hook = Box<dyn FnOnce() + Send>;

    /// Memory backend that runs a one-shot hook inside the next PUT, while
    /// no ledger lock is held.
    #[derive(Clone, Default)]
    struct HookBackend {
        inner: MemoryBackend,
        on_put: Arc<Mutex<Option<Hook>>>,
    }

    struct HookConnection {
        backend: HookBackend,
        inner: Box<dyn BackendConnection>,
    }

    impl ObjectBackend for HookBackend {
        fn connect(&self) -> Result<Box<dyn BackendConnection>, BackendError> {
            Ok(Box::new(HookConnection {
                backend: self.clone(),
                inner: self.inner.connect()?,
            }))
        }
    }

    impl BackendConnection for HookConnection {
        fn put_object(&mut self, id: &ObjectId, data: &[u8]) -> StatusCode {
            let status = self.inner.put_object(id, data);
            let hook = self.backend.on_put.lock().take();
            if let Some(hook) = hook {
                hook();
            }
            status
        }

        fn get_object(&mut self, id: &ObjectId) -> Result<Bytes, StatusCode> {
            self.inner.get_object(id)
        }

        fn delete_object(&mut self, id: &ObjectId) -> StatusCode {
            self.inner.delete_object(id)
        }

        fn reauthenticate(&mut self) -> Result<(), BackendError> {
            self.inner.reauthenticate()
        }
    }

    struct Fixture {
        _tmp: TempDir,
        ledger: Arc<Ledger>,
        store: BlockStore,
        tracker: Arc<CacheUsageTracker>,
        accounting: Arc<Accounting>,
        backend: HookBackend,
        engine: TransferEngine,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            let config = HcfsConfig::for_root(tmp.path()).retry(3, Duration::from_millis(1));
            let layout = Arc::new(HashedLayout::new(&config.paths.meta_dir, &config.paths.block_dir, 4));
            layout.ensure_dirs().unwrap();
            let resolver: Arc<dyn PathResolver> = layout;
            let ledger = Arc::new(Ledger::new(Arc::clone(&resolver), false));
            let store = BlockStore::new(resolver, false);
            let accounting = Arc::new(Accounting::new(&config.paths.system_data, false));
            let tracker = Arc::new(CacheUsageTracker::new(
                Arc::clone(&accounting),
                Arc::new(CachePressure::new()),
                config.cache.soft_limit,
            ));
            let backend = HookBackend::default();
            let engine = TransferEngine::new(
                Arc::clone(&ledger),
                store.clone(),
                Arc::clone(&tracker),
                Arc::clone(&accounting),
                Arc::new(backend.clone()),
                &config,
            );
            Self {
                _tmp: tmp,
                ledger,
                store,
                tracker,
                accounting,
                backend,
                engine,
            }
        }

        fn write_local(&self, inode: InodeId, block: BlockIndex, data: &[u8]) {
            let mut guard = self.ledger.lock(inode).unwrap();
            let prior = guard.record(block).unwrap();
            self.store.write(inode, block, data).unwrap();
            guard
                .set_record(block, BlockRecord::local(data.len() as u64, prior.object_version, 0))
                .unwrap();
            drop(guard);
            self.tracker.record_block_materialized(inode, data.len() as u64, true);
        }

        fn record(&self, inode: InodeId, block: BlockIndex) -> BlockRecord {
            self.ledger.lock(inode).unwrap().record(block).unwrap()
        }
    }

    #[test]
    fn test_upload_marks_both_and_counts_object() {
        let f = Fixture::new();
        f.write_local(1, 0, b"hello");

        let outcome = f.engine.upload_block(1, 0).unwrap();
        assert_eq!(outcome, UploadOutcome::Uploaded(NonZeroU64::MIN));
        let record = f.record(1, 0);
        assert_eq!(record.status, BlockStatus::Both);
        assert_eq!(record.object_version, Some(NonZeroU64::MIN));
        assert_eq!(&f.backend.inner.get("data_1_0").unwrap()[..], b"hello");

        let acct = f.accounting.snapshot();
        assert_eq!(acct.backend_objects, 1);
        assert_eq!(acct.backend_size, 5);
        assert_eq!(acct.dirty_cache_size, 0);
        assert_eq!(f.engine.upload_block(1, 0).unwrap(), UploadOutcome::Skipped);
    }

    #[test]
    fn test_rewrite_during_upload_is_superseded() {
        let f = Fixture::new();
        f.write_local(2, 0, b"first");
        let ledger = Arc::clone(&f.ledger);
        let store = f.store.clone();
        let tracker = Arc::clone(&f.tracker);
        *f.backend.on_put.lock() = Some(Box::new(move || {
            let mut guard = ledger.lock(2).unwrap();
            let prior = guard.record(0).unwrap();
            store.write(2, 0, b"second!").unwrap();
            guard.set_record(0, BlockRecord::local(7, prior.object_version, 0)).unwrap();
            drop(guard);
            tracker.record_block_replaced(2, Some((5, true)), 7, true);
        }));

        assert_eq!(f.engine.upload_block(2, 0).unwrap(), UploadOutcome::Superseded);
        let record = f.record(2, 0);
        assert_eq!(record.status, BlockStatus::Local);
        assert_eq!(record.object_version, Some(NonZeroU64::MIN));
        assert_eq!(f.accounting.snapshot().backend_objects, 1);

        let version = NonZeroU64::new(2).unwrap();
        assert_eq!(f.engine.upload_block(2, 0).unwrap(), UploadOutcome::Uploaded(version));
        assert_eq!(&f.backend.inner.get("data_2_0").unwrap()[..], b"second!");
        let acct = f.accounting.snapshot();
        assert_eq!(acct.backend_objects, 1);
        assert_eq!(acct.dirty_cache_size, 0);
        assert_eq!(acct.cache_size, 7);
    }

    #[test]
    fn test_delete_during_upload_leaves_object_for_delete_pass() {
        let f = Fixture::new();
        f.write_local(3, 0, b"doomed");
        let ledger = Arc::clone(&f.ledger);
        *f.backend.on_put.lock() = Some(Box::new(move || {
            let mut guard = ledger.lock(3).unwrap();
            guard
                .transition(0, |r| {
                    r.status = BlockStatus::Deleted;
                    r.prior = BlockStatus::None;
                })
                .unwrap();
        }));

        assert_eq!(f.engine.upload_block(3, 0).unwrap(), UploadOutcome::Superseded);
        assert_eq!(f.record(3, 0).status, BlockStatus::Deleted);
        assert!(f.backend.inner.contains("data_3_0"));

        assert_eq!(f.engine.delete_block_object(3, 0).unwrap(), DeleteOutcome::Purged);
        assert!(!f.backend.inner.contains("data_3_0"));
        assert_eq!(f.record(3, 0).status, BlockStatus::None);
        assert_eq!(f.accounting.snapshot().backend_objects, 0);
    }

    #[test]
    fn test_panicking_upload_restores_local_with_marker() {
        let f = Fixture::new();
        f.write_local(7, 0, b"unwinds");
        *f.backend.on_put.lock() = Some(Box::new(|| panic!("connection handler crashed")));

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f.engine.upload_block(7, 0)));
        assert!(result.is_err());
        let record = f.record(7, 0);
        assert_eq!(record.status, BlockStatus::Local);
        assert_eq!(record.object_version, Some(NonZeroU64::MIN));
        assert_eq!(f.tracker.snapshot(7).unwrap().in_flight, 0);
        assert_eq!(f.accounting.snapshot().backend_objects, 1);

        let version = NonZeroU64::new(2).unwrap();
        assert_eq!(f.engine.upload_block(7, 0).unwrap(), UploadOutcome::Uploaded(version));
        let acct = f.accounting.snapshot();
        assert_eq!(acct.backend_objects, 1);
        assert_eq!(acct.dirty_cache_size, 0);
    }

    #[test]
    fn test_delete_without_remote_object_purges_locally() {
        let f = Fixture::new();
        {
            let mut guard = f.ledger.lock(4).unwrap();
            let mut record = BlockRecord::local(3, None, 0);
            record.status = BlockStatus::Deleted;
            guard.set_record(0, record).unwrap();
        }
        assert_eq!(f.engine.delete_block_object(4, 0).unwrap(), DeleteOutcome::Purged);
        assert_eq!(f.backend.inner.stats().deletes.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_fetch_restores_local_copy() {
        let f = Fixture::new();
        f.backend.inner.insert("data_5_1", &b"remote bytes"[..]);
        {
            let mut guard = f.ledger.lock(5).unwrap();
            let mut record = BlockRecord::local(12, NonZeroU64::new(1), 0);
            record.status = BlockStatus::Cloud;
            guard.set_record(1, record).unwrap();
        }

        f.engine.fetch_from_cloud(5, 1).unwrap();
        assert_eq!(f.record(5, 1).status, BlockStatus::Both);
        assert_eq!(&f.store.read(5, 1).unwrap()[..], b"remote bytes");
        assert_eq!(f.tracker.snapshot(5).unwrap().clean_cache_size, 12);
        assert_eq!(f.engine.stats().downloads.load(Ordering::Relaxed), 1);

        // Already local: nothing to do.
        f.engine.fetch_from_cloud(5, 1).unwrap();
        assert_eq!(f.engine.stats().downloads.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_missing_remote_object_fails_and_stays_cloud() {
        let f = Fixture::new();
        {
            let mut guard = f.ledger.lock(6).unwrap();
            let mut record = BlockRecord::local(4, NonZeroU64::new(1), 0);
            record.status = BlockStatus::Cloud;
            guard.set_record(0, record).unwrap();
        }

        let err = f.engine.fetch_from_cloud(6, 0).unwrap_err();
        assert!(matches!(err, BlockError::PermanentBackend { .. }), "{err}");
        assert_eq!(f.record(6, 0).status, BlockStatus::Cloud);
        assert!(!f.store.staging_path(6, 0).exists());
    }
}
