//! Shared helpers for the hcfs-core integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use hcfs_core::backend::{
    BackendConnection, BackendError, MemoryBackend, ObjectBackend, ObjectId, Operation, StatusCode,
};
use hcfs_core::ledger::TransitionObserver;
use hcfs_core::{BlockCache, BlockIndex, BlockStatus, HcfsConfig, InodeId};
use parking_lot::Mutex;

/// Install a test-writer subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Configuration for a cache rooted in `root` with fast timers, no fsync
/// and generous limits.
pub fn test_config(root: &Path) -> HcfsConfig {
    let mut config = HcfsConfig::for_root(root)
        .block_size(64 * 1024)
        .cache_limits(64 * 1024 * 1024, 128 * 1024 * 1024)
        .sync_interval(Duration::from_millis(20))
        .retry(5, Duration::from_millis(1))
        .hard_limit_wait(Duration::from_millis(200))
        .transfer_concurrency(4);
    config.paths.subdirs = 8;
    config.cache.fsync = false;
    config.cache.reclaim_interval = Duration::from_millis(20);
    config.retry.max_backoff = Duration::from_millis(5);
    config.accounting.flush_interval = Duration::from_millis(50);
    config
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Memory backend that answers from a script of canned statuses before
/// touching the real store.
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    inner: MemoryBackend,
    script: Arc<Mutex<Script>>,
    reauthentications: Arc<AtomicU64>,
    panic_on_put: Arc<AtomicBool>,
}

#[derive(Default)]
struct Script {
    put: VecDeque<StatusCode>,
    get: VecDeque<StatusCode>,
    delete: VecDeque<StatusCode>,
}

impl Script {
    fn queue(&mut self, op: Operation) -> &mut VecDeque<StatusCode> {
        match op {
            Operation::Put => &mut self.put,
            Operation::Get => &mut self.get,
            Operation::Delete => &mut self.delete,
        }
    }
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` requests of kind `op` with `status`.
    pub fn fail_next(&self, op: Operation, status: StatusCode, n: usize) {
        let mut script = self.script.lock();
        let queue = script.queue(op);
        queue.extend(std::iter::repeat_n(status, n));
    }

    /// Fail every request of kind `op` with `status` until cleared.
    pub fn fail_all(&self, op: Operation, status: StatusCode) {
        self.fail_next(op, status, 1_000_000);
    }

    /// Panic inside the next PUT, after the object is stored.
    pub fn panic_next_put(&self) {
        self.panic_on_put.store(true, Ordering::Relaxed);
    }

    pub fn clear(&self) {
        *self.script.lock() = Script::default();
    }

    pub fn store(&self) -> &MemoryBackend {
        &self.inner
    }

    pub fn reauthentications(&self) -> u64 {
        self.reauthentications.load(Ordering::Relaxed)
    }

    fn next_failure(&self, op: Operation) -> Option<StatusCode> {
        self.script.lock().queue(op).pop_front()
    }
}

impl ObjectBackend for ScriptedBackend {
    fn connect(&self) -> Result<Box<dyn BackendConnection>, BackendError> {
        Ok(Box::new(ScriptedConnection {
            backend: self.clone(),
            inner: self.inner.connect()?,
        }))
    }
}

struct ScriptedConnection {
    backend: ScriptedBackend,
    inner: Box<dyn BackendConnection>,
}

impl BackendConnection for ScriptedConnection {
    fn put_object(&mut self, id: &ObjectId, data: &[u8]) -> StatusCode {
        let status = match self.backend.next_failure(Operation::Put) {
            Some(status) => status,
            None => self.inner.put_object(id, data),
        };
        if self.backend.panic_on_put.swap(false, Ordering::Relaxed) {
            panic!("scripted panic during PUT of {id}");
        }
        status
    }

    fn get_object(&mut self, id: &ObjectId) -> Result<Bytes, StatusCode> {
        match self.backend.next_failure(Operation::Get) {
            Some(status) => Err(status),
            None => self.inner.get_object(id),
        }
    }

    fn delete_object(&mut self, id: &ObjectId) -> StatusCode {
        match self.backend.next_failure(Operation::Delete) {
            Some(status) => status,
            None => self.inner.delete_object(id),
        }
    }

    fn reauthenticate(&mut self) -> Result<(), BackendError> {
        self.backend.reauthentications.fetch_add(1, Ordering::Relaxed);
        self.inner.reauthenticate()
    }
}

/// Observer that records every committed status change.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<(InodeId, BlockIndex, BlockStatus, BlockStatus)>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Statuses `block` passed through, in order.
    pub fn statuses(&self, inode: InodeId, block: BlockIndex) -> Vec<BlockStatus> {
        self.events
            .lock()
            .iter()
            .filter(|(i, b, _, _)| *i == inode && *b == block)
            .map(|(_, _, _, to)| *to)
            .collect()
    }

    pub fn count_to(&self, status: BlockStatus) -> usize {
        self.events.lock().iter().filter(|(_, _, _, to)| *to == status).count()
    }
}

impl TransitionObserver for RecordingObserver {
    fn on_transition(&self, inode: InodeId, block: BlockIndex, from: BlockStatus, to: BlockStatus) {
        self.events.lock().push((inode, block, from, to));
    }
}

/// Payload of `len` bytes derived from `seed`.
pub fn payload(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add((i % 251) as u8)).collect()
}

/// Cache usage as the ledgers record it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LedgerUsage {
    pub clean: u64,
    pub dirty: u64,
    pub blocks: u64,
}

/// Usage of `inode`, or of every inode when `None`.
pub fn ledger_usage(cache: &BlockCache, inode: Option<InodeId>) -> LedgerUsage {
    let inodes = match inode {
        Some(inode) => vec![inode],
        None => cache.ledger().inodes().unwrap(),
    };
    let mut usage = LedgerUsage::default();
    for inode in inodes {
        let Some(guard) = cache.ledger().try_lock_existing(inode).unwrap() else {
            continue;
        };
        for (_, record) in guard.records().unwrap() {
            match record.status.cached() {
                Some(true) => usage.dirty += record.size,
                Some(false) => usage.clean += record.size,
                None => continue,
            }
            usage.blocks += 1;
        }
    }
    usage
}

/// The accounting and the tracker agree with the ledgers.
pub fn assert_counters_match_ledger(cache: &BlockCache) {
    let usage = ledger_usage(cache, None);
    let acct = cache.accounting();
    assert_eq!(acct.cache_size, usage.clean + usage.dirty, "cache_size vs ledger {usage:?}");
    assert_eq!(acct.dirty_cache_size, usage.dirty, "dirty_cache_size vs ledger {usage:?}");
    assert_eq!(acct.cache_blocks, usage.blocks, "cache_blocks vs ledger {usage:?}");
    assert_eq!(cache.tracker().totals(), (usage.clean, usage.dirty), "tracker vs ledger");
}

/// With no transfer in flight, a block file exists exactly for the records
/// that hold a local copy, and no staging file is left.
pub fn assert_files_match_ledger(cache: &BlockCache) {
    for inode in cache.ledger().inodes().unwrap() {
        let guard = cache.ledger().try_lock_existing(inode).unwrap().unwrap();
        for (block, record) in guard.records().unwrap() {
            assert!(!record.status.is_transient(), "{inode}/{block} still {}", record.status);
            assert_eq!(
                cache.store().exists(inode, block),
                record.status.has_local_copy(),
                "{inode}/{block} is {}",
                record.status
            );
            assert!(!cache.store().staging_path(inode, block).exists());
        }
    }
}
