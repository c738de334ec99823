//! Per-inode sync scheduler.
//!
//! Dirty inodes are flushed to the backend by a fixed set of sync workers.
//! An inode is always routed to worker `inode % workers`, and a registry
//! entry per inode tracks whether a pass is queued or running, so at most
//! one pass per inode exists at any time. Requests that arrive while a pass
//! runs set a rerun flag instead of queueing a second pass.
//!
//! ```text
//!  write_block ──mark_dirty──► dirty set ──(every interval)──► handler
//!                                                               │
//!  sync_now ─────────────────────────────────┐                  │
//!                                            ▼                  ▼
//!                                   registry: queued / running / rerun
//!                                            │
//!                                            ▼ inode % N
//!                                       sync worker ──► upload / delete pools
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::InodeId;
use crate::accounting::Accounting;
use crate::config::HcfsConfig;
use crate::error::{BlockError, BlockResult};
use crate::ledger::Ledger;
use crate::status::BlockStatus;
use crate::tracker::CacheUsageTracker;
use crate::transfer::{DeleteOutcome, TransferEngine, UploadOutcome};
use crate::worker::WorkerPool;

/// Counters of the sync scheduler.
#[derive(Debug, Default)]
pub struct SyncStats {
    /// Passes run.
    pub passes: AtomicU64,
    /// Passes that ended with an error.
    pub failed_passes: AtomicU64,
    /// Requests folded into a queued or running pass.
    pub coalesced: AtomicU64,
    /// Unlinked inodes whose meta file was removed.
    pub inodes_removed: AtomicU64,
}

/// What one sync pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassOutcome {
    /// Blocks uploaded.
    pub uploaded: usize,
    /// Remote objects deleted.
    pub deleted: usize,
    /// Work left over for a later pass.
    pub remaining: bool,
    /// The inode was unlinked and its meta file is gone.
    pub removed: bool,
}

#[derive(Debug, Default)]
struct InodeSync {
    queued: bool,
    running: bool,
    rerun: bool,
    started: u64,
    finished: u64,
    /// Callers waiting, keyed by the pass number they wait for.
    waiting: BTreeMap<u64, usize>,
    /// Results of finished passes that still have waiters.
    outcomes: HashMap<u64, Option<BlockError>>,
}

impl InodeSync {
    fn is_idle(&self) -> bool {
        !self.queued && !self.running && !self.rerun && self.waiting.is_empty()
    }

    fn stop_waiting(&mut self, pass: u64) {
        if let Some(count) = self.waiting.get_mut(&pass) {
            *count -= 1;
            if *count == 0 {
                self.waiting.remove(&pass);
                self.outcomes.remove(&pass);
            }
        }
    }
}

enum PassJob {
    Upload(BlockResult<UploadOutcome>),
    Delete(BlockResult<DeleteOutcome>),
}

struct SyncInner {
    engine: Arc<TransferEngine>,
    ledger: Arc<Ledger>,
    tracker: Arc<CacheUsageTracker>,
    accounting: Arc<Accounting>,
    upload_workers: Arc<WorkerPool>,
    delete_workers: Arc<WorkerPool>,
    upload_meta: bool,
    interval: Duration,
    registry: Mutex<HashMap<InodeId, InodeSync>>,
    pass_done: Condvar,
    dirty: Mutex<BTreeSet<InodeId>>,
    wake: Condvar,
    /// Set under the dirty lock by `flush`; the handler skips its wait.
    urgent: AtomicBool,
    senders: Mutex<Vec<Sender<InodeId>>>,
    shutdown: AtomicBool,
    stats: SyncStats,
}

/// Fixed pool of sync workers keyed by inode.
pub struct SyncScheduler {
    inner: Arc<SyncInner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for SyncScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncScheduler")
            .field("workers", &self.inner.senders.lock().len())
            .field("interval", &self.inner.interval)
            .finish_non_exhaustive()
    }
}

impl SyncScheduler {
    /// Start the handler thread and `config.transfer.sync_concurrency`
    /// workers.
    pub fn new(
        engine: Arc<TransferEngine>,
        ledger: Arc<Ledger>,
        tracker: Arc<CacheUsageTracker>,
        accounting: Arc<Accounting>,
        upload_workers: Arc<WorkerPool>,
        delete_workers: Arc<WorkerPool>,
        config: &HcfsConfig,
    ) -> Self {
        let workers = config.transfer.sync_concurrency.max(1);
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..workers).map(|_| unbounded()).unzip();
        let inner = Arc::new(SyncInner {
            engine,
            ledger,
            tracker,
            accounting,
            upload_workers,
            delete_workers,
            upload_meta: config.sync.upload_meta,
            interval: config.sync.interval,
            registry: Mutex::new(HashMap::new()),
            pass_done: Condvar::new(),
            dirty: Mutex::new(BTreeSet::new()),
            wake: Condvar::new(),
            urgent: AtomicBool::new(false),
            senders: Mutex::new(senders),
            shutdown: AtomicBool::new(false),
            stats: SyncStats::default(),
        });

        let mut threads = Vec::with_capacity(workers + 1);
        for (worker_id, rx) in receivers.into_iter().enumerate() {
            let inner = Arc::clone(&inner);
            threads.push(
                thread::Builder::new()
                    .name(format!("hcfs-sync-{worker_id}"))
                    .spawn(move || worker_loop(&inner, worker_id, &rx))
                    .expect("failed to spawn sync worker thread"),
            );
        }
        let handler = Arc::clone(&inner);
        threads.push(
            thread::Builder::new()
                .name("hcfs-sync-handler".into())
                .spawn(move || handler_loop(&handler))
                .expect("failed to spawn sync handler thread"),
        );

        info!(workers, interval_ms = u64::try_from(config.sync.interval.as_millis()).unwrap_or(u64::MAX), "Sync scheduler started");
        Self {
            inner,
            threads: Mutex::new(threads),
        }
    }

    /// Schedule `inode` for the next batched dispatch.
    pub fn mark_dirty(&self, inode: InodeId) {
        if !self.inner.shutdown.load(Ordering::Acquire) {
            self.inner.dirty.lock().insert(inode);
        }
    }

    /// Dispatch every inode in `inodes` without waiting for the next tick.
    pub fn flush(&self, inodes: impl IntoIterator<Item = InodeId>) {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return;
        }
        let mut dirty = self.inner.dirty.lock();
        dirty.extend(inodes);
        self.inner.urgent.store(true, Ordering::Release);
        self.inner.wake.notify_one();
    }

    /// Run a sync pass for `inode` and wait for it.
    ///
    /// Only a pass that starts after this call counts, so every write that
    /// returned before the call is covered. The result is that pass's own,
    /// even when later passes have finished by the time the caller wakes.
    pub fn sync_now(&self, inode: InodeId) -> BlockResult<()> {
        let inner = &self.inner;
        if inner.shutdown.load(Ordering::Acquire) {
            return Err(BlockError::ShutDown);
        }
        let mut registry = inner.registry.lock();
        let target = {
            let state = registry.entry(inode).or_default();
            let target = state.started + 1;
            *state.waiting.entry(target).or_default() += 1;
            target
        };
        inner.request_locked(&mut registry, inode);

        loop {
            let Some(state) = registry.get_mut(&inode) else {
                return Err(BlockError::ShutDown);
            };
            let outcome = if state.finished >= target {
                let error = state.outcomes.get(&target).and_then(Option::as_ref);
                Some(error.map_or(Ok(()), |e| Err(e.clone_lossy())))
            } else if inner.shutdown.load(Ordering::Acquire) && !state.queued && !state.running {
                Some(Err(BlockError::ShutDown))
            } else {
                None
            };
            if let Some(outcome) = outcome {
                state.stop_waiting(target);
                if state.is_idle() {
                    registry.remove(&inode);
                }
                return outcome;
            }
            inner.pass_done.wait(&mut registry);
        }
    }

    /// Scheduler counters.
    pub fn stats(&self) -> &SyncStats {
        &self.inner.stats
    }

    /// Whether any pass is queued or running.
    pub fn is_busy(&self) -> bool {
        self.inner
            .registry
            .lock()
            .values()
            .any(|s| s.queued || s.running)
    }

    /// Stop dispatching, let running passes finish and join every thread.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let _dirty = self.inner.dirty.lock();
            self.inner.wake.notify_all();
        }
        {
            let _registry = self.inner.registry.lock();
            self.inner.senders.lock().clear();
        }
        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            let _ = handle.join();
        }
        let _registry = self.inner.registry.lock();
        self.inner.pass_done.notify_all();
        info!("Sync scheduler stopped");
    }
}

impl SyncInner {
    fn request(&self, inode: InodeId) {
        let mut registry = self.registry.lock();
        self.request_locked(&mut registry, inode);
    }

    /// Queue a pass for `inode` unless one is already queued; a running
    /// pass is asked to rerun.
    fn request_locked(&self, registry: &mut MutexGuard<'_, HashMap<InodeId, InodeSync>>, inode: InodeId) {
        let state = registry.entry(inode).or_default();
        if state.running {
            if state.rerun {
                self.stats.coalesced.fetch_add(1, Ordering::Relaxed);
            }
            state.rerun = true;
        } else if state.queued {
            self.stats.coalesced.fetch_add(1, Ordering::Relaxed);
        } else if self.dispatch(inode) {
            state.queued = true;
        }
    }

    fn dispatch(&self, inode: InodeId) -> bool {
        let senders = self.senders.lock();
        if senders.is_empty() {
            return false;
        }
        // Truncation only affects which worker is picked.
        #[allow(clippy::cast_possible_truncation)]
        let worker = (inode % senders.len() as u64) as usize;
        senders[worker].send(inode).is_ok()
    }

    fn run_pass(&self, inode: InodeId) -> BlockResult<PassOutcome> {
        let (records, unlinked) = match self.ledger.try_lock_existing(inode)? {
            Some(guard) => (guard.records()?, guard.header().is_unlinked()),
            None => return Ok(PassOutcome::default()),
        };

        let (tx, rx) = unbounded();
        let mut submit_error = None;
        let mut pending = BTreeSet::new();
        for (block, record) in records {
            let engine = Arc::clone(&self.engine);
            let tx = tx.clone();
            let submitted = match record.status {
                BlockStatus::Local => self.upload_workers.submit(move || {
                    let _ = tx.send((block, PassJob::Upload(engine.upload_block(inode, block))));
                }),
                BlockStatus::Deleted => self.delete_workers.submit(move || {
                    let _ = tx.send((block, PassJob::Delete(engine.delete_block_object(inode, block))));
                }),
                _ => continue,
            };
            if submitted.is_err() {
                submit_error = Some(BlockError::ShutDown);
                break;
            }
            pending.insert(block);
        }
        drop(tx);

        let mut outcome = PassOutcome::default();
        let mut first_error = submit_error;
        for (block, job) in rx.iter() {
            pending.remove(&block);
            match job {
                PassJob::Upload(Ok(UploadOutcome::Uploaded(_))) => outcome.uploaded += 1,
                PassJob::Upload(Ok(UploadOutcome::Superseded)) => outcome.remaining = true,
                PassJob::Delete(Ok(DeleteOutcome::Purged | DeleteOutcome::Detached)) => outcome.deleted += 1,
                PassJob::Upload(Ok(UploadOutcome::Skipped)) | PassJob::Delete(Ok(DeleteOutcome::Skipped)) => {}
                PassJob::Upload(Err(e)) | PassJob::Delete(Err(e)) => {
                    outcome.remaining = true;
                    first_error.get_or_insert(e);
                }
            }
        }
        // A job that unwound never reports back.
        if let Some(&block) = pending.first() {
            warn!(inode, block, jobs = pending.len(), "Transfer jobs aborted during sync pass");
            outcome.remaining = true;
            first_error
                .get_or_insert(BlockError::consistency(inode, block, "transfer job aborted"));
        }

        if self.upload_meta && !unlinked && outcome.uploaded + outcome.deleted > 0 {
            if let Err(e) = self.engine.upload_meta(inode) {
                warn!(inode, error = %e, "Meta snapshot upload failed");
                outcome.remaining = true;
                first_error.get_or_insert(e);
            }
        }

        if unlinked && first_error.is_none() {
            outcome.removed = self.remove_unlinked(inode)?;
        }

        debug!(inode, uploaded = outcome.uploaded, deleted = outcome.deleted, remaining = outcome.remaining, "Sync pass finished");
        match first_error {
            Some(e) => Err(e),
            None => Ok(outcome),
        }
    }

    /// Drop an unlinked inode whose records are all purged.
    fn remove_unlinked(&self, inode: InodeId) -> BlockResult<bool> {
        let is_empty = |ledger: &Ledger| -> BlockResult<bool> {
            Ok(match ledger.try_lock_existing(inode)? {
                Some(guard) => guard.header().is_unlinked() && guard.records()?.is_empty(),
                None => false,
            })
        };
        if !is_empty(&self.ledger)? {
            return Ok(false);
        }
        if self.upload_meta {
            self.engine.delete_meta(inode)?;
        }
        let Some(guard) = self.ledger.try_lock_existing(inode)? else {
            return Ok(false);
        };
        if !guard.header().is_unlinked() || !guard.records()?.is_empty() {
            return Ok(false);
        }
        guard.remove_file()?;
        self.tracker.forget(inode);
        self.accounting.update(|acct| {
            acct.total_inodes = acct.total_inodes.saturating_sub(1);
        });
        self.stats.inodes_removed.fetch_add(1, Ordering::Relaxed);
        info!(inode, "Removed unlinked inode");
        Ok(true)
    }
}

fn worker_loop(inner: &SyncInner, worker_id: usize, rx: &Receiver<InodeId>) {
    debug!(worker_id, "Sync worker started");
    for inode in rx.iter() {
        {
            let mut registry = inner.registry.lock();
            let state = registry.entry(inode).or_default();
            state.queued = false;
            state.running = true;
            state.started += 1;
        }

        let result = inner.run_pass(inode);
        inner.stats.passes.fetch_add(1, Ordering::Relaxed);
        let remaining = match &result {
            Ok(outcome) => outcome.remaining,
            Err(e) => {
                inner.stats.failed_passes.fetch_add(1, Ordering::Relaxed);
                warn!(inode, error = %e, "Sync pass failed, inode stays dirty");
                true
            }
        };

        let mut registry = inner.registry.lock();
        let state = registry.entry(inode).or_default();
        state.running = false;
        state.finished += 1;
        let pass = state.finished;
        if state.waiting.contains_key(&pass) {
            state.outcomes.insert(pass, result.err());
        }
        let shutting_down = inner.shutdown.load(Ordering::Acquire);
        if state.rerun && !shutting_down {
            state.rerun = false;
            if inner.dispatch(inode) {
                state.queued = true;
            }
        } else {
            state.rerun = false;
            if remaining && !shutting_down {
                inner.dirty.lock().insert(inode);
            }
        }
        if state.is_idle() {
            registry.remove(&inode);
        }
        inner.pass_done.notify_all();
    }
    debug!(worker_id, "Sync worker exiting");
}

fn handler_loop(inner: &SyncInner) {
    let mut dirty = inner.dirty.lock();
    loop {
        if inner.shutdown.load(Ordering::Acquire) {
            break;
        }
        if !inner.urgent.swap(false, Ordering::AcqRel) {
            inner.wake.wait_for(&mut dirty, inner.interval);
            inner.urgent.store(false, Ordering::Release);
        }
        if inner.shutdown.load(Ordering::Acquire) {
            break;
        }
        if dirty.is_empty() {
            continue;
        }
        let batch = std::mem::take(&mut *dirty);
        MutexGuard::unlocked(&mut dirty, || {
            for inode in batch {
                inner.request(inode);
            }
        });
    }
    debug!("Sync handler exiting");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;

    use bytes::Bytes;
    use crossbeam_channel::bounded;

    use super::*;
    use crate::accounting::CachePressure;
    use crate::backend::{
        BackendConnection, BackendError, MemoryBackend, ObjectBackend, ObjectId, StatusCode,
    };
    use crate::block_store::BlockStore;
    use crate::layout::{HashedLayout, PathResolver};
    use crate::status::BlockRecord;

    struct Fixture {
        _tmp: TempDir,
        ledger: Arc<Ledger>,
        store: BlockStore,
        backend: MemoryBackend,
        sync: SyncScheduler,
    }

    type Gate = (Sender<()>, Receiver<()>);

    /// Memory backend whose first PUT reports that it started, waits to be
    /// released and is then rejected.
    #[derive(Clone)]
    struct GatedBackend {
        inner: MemoryBackend,
        gate: Arc<Mutex<Option<Gate>>>,
    }

    struct GatedConnection {
        gate: Arc<Mutex<Option<Gate>>>,
        inner: Box<dyn BackendConnection>,
    }

    impl ObjectBackend for GatedBackend {
        fn connect(&self) -> Result<Box<dyn BackendConnection>, BackendError> {
            Ok(Box::new(GatedConnection {
                gate: Arc::clone(&self.gate),
                inner: self.inner.connect()?,
            }))
        }
    }

    impl BackendConnection for GatedConnection {
        fn put_object(&mut self, id: &ObjectId, data: &[u8]) -> StatusCode {
            let gate = self.gate.lock().take();
            match gate {
                Some((started, release)) => {
                    started.send(()).unwrap();
                    release.recv().unwrap();
                    StatusCode(400)
                }
                None => self.inner.put_object(id, data),
            }
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

    fn fixture(interval: Duration) -> Fixture {
        let backend = MemoryBackend::new();
        fixture_on(interval, backend.clone(), Arc::new(backend))
    }

    fn fixture_on(
        interval: Duration,
        backend: MemoryBackend,
        remote: Arc<dyn ObjectBackend>,
    ) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let config = HcfsConfig::for_root(tmp.path()).sync_interval(interval);
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
        let engine = Arc::new(TransferEngine::new(
            Arc::clone(&ledger),
            store.clone(),
            Arc::clone(&tracker),
            Arc::clone(&accounting),
            remote,
            &config,
        ));
        let sync = SyncScheduler::new(
            engine,
            Arc::clone(&ledger),
            tracker,
            accounting,
            Arc::new(WorkerPool::new("upload", 2, 16)),
            Arc::new(WorkerPool::new("delete", 2, 16)),
            &config,
        );
        Fixture {
            _tmp: tmp,
            ledger,
            store,
            backend,
            sync,
        }
    }

    impl Fixture {
        fn write_local(&self, inode: InodeId, block: u64, data: &[u8]) {
            let mut guard = self.ledger.lock(inode).unwrap();
            self.store.write(inode, block, data).unwrap();
            guard
                .set_record(block, BlockRecord::local(data.len() as u64, None, 0))
                .unwrap();
        }

        fn status(&self, inode: InodeId, block: u64) -> BlockStatus {
            self.ledger.lock(inode).unwrap().record(block).unwrap().status
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.sync.shutdown();
        }
    }

    #[test]
    fn test_sync_now_uploads_and_snapshots_meta() {
        let f = fixture(Duration::from_secs(3600));
        f.write_local(1, 0, b"a");
        f.write_local(1, 1, b"bb");

        f.sync.sync_now(1).unwrap();
        assert_eq!(f.status(1, 0), BlockStatus::Both);
        assert_eq!(f.status(1, 1), BlockStatus::Both);
        assert!(f.backend.contains("data_1_0"));
        assert!(f.backend.contains("data_1_1"));
        assert!(f.backend.contains("meta_1"));
        assert_eq!(f.sync.stats().passes.load(Ordering::Relaxed), 1);
        assert!(!f.sync.is_busy());
    }

    #[test]
    fn test_sync_of_unknown_inode_is_a_no_op() {
        let f = fixture(Duration::from_secs(3600));
        f.sync.sync_now(42).unwrap();
        assert!(f.backend.is_empty());
    }

    #[test]
    fn test_mark_dirty_is_picked_up_by_the_handler() {
        let f = fixture(Duration::from_millis(10));
        f.write_local(2, 0, b"later");
        f.sync.mark_dirty(2);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while f.status(2, 0) != BlockStatus::Both {
            assert!(std::time::Instant::now() < deadline, "dirty inode never synced");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_flush_wakes_a_sleeping_handler() {
        let f = fixture(Duration::from_secs(3600));
        f.write_local(3, 0, b"now");
        f.sync.flush([3]);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while f.status(3, 0) != BlockStatus::Both {
            assert!(std::time::Instant::now() < deadline, "flush did not dispatch");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_concurrent_sync_requests_share_passes() {
        let f = fixture(Duration::from_secs(3600));
        f.write_local(4, 0, b"shared");
        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| f.sync.sync_now(4).unwrap());
            }
        });
        assert_eq!(f.status(4, 0), BlockStatus::Both);
        assert_eq!(f.backend.stats().puts.load(Ordering::Relaxed), 2, "one block and one meta put");
        assert!(f.sync.stats().passes.load(Ordering::Relaxed) <= 8);
    }

    #[test]
    fn test_waiter_gets_the_result_of_its_own_pass() {
        let (started_tx, started_rx) = bounded(1);
        let (release_tx, release_rx) = bounded(1);
        let memory = MemoryBackend::new();
        let gated = GatedBackend {
            inner: memory.clone(),
            gate: Arc::new(Mutex::new(Some((started_tx, release_rx)))),
        };
        let f = fixture_on(Duration::from_secs(3600), memory, Arc::new(gated));
        f.write_local(6, 0, b"retried");

        thread::scope(|s| {
            let first = s.spawn(|| f.sync.sync_now(6));
            started_rx.recv().unwrap();
            // The first pass is stuck in its PUT; this caller waits for the
            // rerun after it.
            let second = s.spawn(|| f.sync.sync_now(6));
            let deadline = std::time::Instant::now() + Duration::from_secs(5);
            while !f.sync.inner.registry.lock().get(&6).is_some_and(|state| state.rerun) {
                assert!(std::time::Instant::now() < deadline, "second request never registered");
                thread::sleep(Duration::from_millis(1));
            }
            release_tx.send(()).unwrap();

            let second = second.join().unwrap();
            let first = first.join().unwrap();
            assert!(matches!(first, Err(BlockError::PermanentBackend { .. })), "{first:?}");
            assert!(second.is_ok(), "{second:?}");
        });
        assert_eq!(f.status(6, 0), BlockStatus::Both);
        assert_eq!(f.sync.stats().failed_passes.load(Ordering::Relaxed), 1);
        assert!(f.sync.inner.registry.lock().is_empty());
    }

    #[test]
    fn test_sync_after_shutdown_fails() {
        let f = fixture(Duration::from_secs(3600));
        f.sync.shutdown();
        f.sync.mark_dirty(5);
        assert!(matches!(f.sync.sync_now(5), Err(BlockError::ShutDown)));
    }
}
