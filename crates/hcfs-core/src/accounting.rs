//! Process-wide cache accounting and cache pressure signalling.
//!
//! [`Accounting`] holds the [`SystemAccounting`] counters under a single
//! mutex and persists them to the system-data file as JSON. The file is only
//! a hint across restarts: on startup the counters are reconciled against a
//! scan of every ledger.
//!
//! [`CachePressure`] connects writers, the tracker and the reclaimer: the
//! tracker signals when the cache grows past the soft limit, writers at the
//! hard limit sleep until the reclaimer reports free space.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::{BlockError, BlockResult};

/// Aggregate counters of the whole cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemAccounting {
    /// Bytes of block data held locally (clean and dirty).
    pub cache_size: u64,
    /// Number of block files counted in `cache_size`.
    pub cache_blocks: u64,
    /// Bytes of local data not yet confirmed uploaded.
    pub dirty_cache_size: u64,
    /// Inodes with a meta file.
    pub total_inodes: u64,
    /// Bytes of remote block objects whose content is current.
    pub backend_size: u64,
    /// Remote block objects.
    pub backend_objects: u64,
}

impl SystemAccounting {
    /// Bytes of local data that could be evicted.
    pub fn clean_cache_size(&self) -> u64 {
        self.cache_size.saturating_sub(self.dirty_cache_size)
    }
}

/// Shared, persisted [`SystemAccounting`].
#[derive(Debug)]
pub struct Accounting {
    state: Mutex<SystemAccounting>,
    path: PathBuf,
    fsync: bool,
}

impl Accounting {
    /// Start from zeroed counters persisted at `path`.
    pub fn new(path: impl Into<PathBuf>, fsync: bool) -> Self {
        Self {
            state: Mutex::new(SystemAccounting::default()),
            path: path.into(),
            fsync,
        }
    }

    /// Load the counters from `path`, or start from zero if the file is
    /// missing or unreadable.
    pub fn load(path: impl Into<PathBuf>, fsync: bool) -> BlockResult<Self> {
        let accounting = Self::new(path, fsync);
        match read_system_data(&accounting.path) {
            Ok(Some(stored)) => *accounting.state.lock() = stored,
            Ok(None) => {}
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                warn!(path = %accounting.path.display(), error = %e, "Ignoring unreadable system data");
            }
            Err(e) => {
                return Err(BlockError::local_io(
                    format!("reading {}", accounting.path.display()),
                    e,
                ));
            }
        }
        Ok(accounting)
    }

    /// Current counters.
    pub fn snapshot(&self) -> SystemAccounting {
        *self.state.lock()
    }

    /// Mutate the counters under the accounting lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut SystemAccounting) -> R) -> R {
        f(&mut self.state.lock())
    }

    /// Location of the system-data file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the counters to disk atomically.
    pub fn persist(&self) -> BlockResult<()> {
        let state = self.state.lock();
        write_system_data(&self.path, &state, self.fsync)
            .map_err(|e| BlockError::local_io(format!("writing {}", self.path.display()), e))?;
        debug!(cache_size = state.cache_size, dirty = state.dirty_cache_size, "Persisted system data");
        Ok(())
    }

    /// Replace the counters with values rebuilt from a ledger scan.
    pub fn reconcile(&self, scanned: SystemAccounting) -> SystemAccounting {
        let mut state = self.state.lock();
        let stale = *state;
        if stale != scanned {
            info!(
                stored_cache_size = stale.cache_size,
                scanned_cache_size = scanned.cache_size,
                stored_dirty = stale.dirty_cache_size,
                scanned_dirty = scanned.dirty_cache_size,
                stored_blocks = stale.cache_blocks,
                scanned_blocks = scanned.cache_blocks,
                "Reconciled system accounting with ledgers"
            );
        }
        *state = scanned;
        stale
    }

    /// Persist the counters every `interval` on a background thread.
    pub fn spawn_flusher(self: &Arc<Self>, interval: Duration) -> AccountingFlusher {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let accounting = Arc::clone(self);
        let thread_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("hcfs-accounting".into())
            .spawn(move || flusher_loop(&accounting, &thread_stop, interval))
            .expect("failed to spawn accounting flusher thread");
        AccountingFlusher {
            stop,
            handle: Some(handle),
            accounting: Arc::clone(self),
        }
    }
}

fn read_system_data(path: &Path) -> io::Result<Option<SystemAccounting>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    serde_json::from_str(&contents)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn write_system_data(path: &Path, state: &SystemAccounting, fsync: bool) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, state).map_err(io::Error::other)?;
    tmp.write_all(b"\n")?;
    if fsync {
        tmp.as_file().sync_all()?;
    }
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

type StopSignal = (Mutex<bool>, Condvar);

fn flusher_loop(accounting: &Accounting, stop: &StopSignal, interval: Duration) {
    let (stopped, cv) = stop;
    let mut guard = stopped.lock();
    while !*guard {
        cv.wait_for(&mut guard, interval);
        if let Err(e) = accounting.persist() {
            warn!(error = %e, "Failed to persist system data");
        }
    }
}

/// Handle to the accounting flusher thread.
#[derive(Debug)]
pub struct AccountingFlusher {
    stop: Arc<StopSignal>,
    handle: Option<JoinHandle<()>>,
    accounting: Arc<Accounting>,
}

impl AccountingFlusher {
    /// Stop the thread and write the counters one last time.
    pub fn stop(mut self) -> BlockResult<()> {
        self.halt();
        self.accounting.persist()
    }

    fn halt(&mut self) {
        {
            let (stopped, cv) = &*self.stop;
            *stopped.lock() = true;
            cv.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for AccountingFlusher {
    fn drop(&mut self) {
        self.halt();
    }
}

#[derive(Debug, Default)]
struct PressureState {
    signaled: bool,
    closed: bool,
}

/// Wake-up channel between the write path and the reclaimer.
#[derive(Debug, Default)]
pub struct CachePressure {
    state: Mutex<PressureState>,
    reclaim: Condvar,
    space: Condvar,
    exhausted: AtomicBool,
}

impl CachePressure {
    /// Create an idle pressure signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the reclaimer to run.
    pub fn signal(&self) {
        self.state.lock().signaled = true;
        self.reclaim.notify_one();
    }

    /// Block until signalled, closed, or `timeout` elapses. Returns whether a
    /// signal was consumed.
    pub fn wait_for_pressure(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if !state.signaled && !state.closed {
            self.reclaim.wait_for(&mut state, timeout);
        }
        std::mem::take(&mut state.signaled)
    }

    /// Block until `has_space` holds or `timeout` elapses. Returns the last
    /// value of `has_space`.
    pub fn wait_for_space(&self, timeout: Duration, has_space: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if has_space() {
                return true;
            }
            if state.closed {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            // Re-check on every wake; notify_space may race with the check.
            self.space.wait_for(&mut state, (deadline - now).min(Duration::from_millis(50)));
        }
    }

    /// Wake every writer waiting for space.
    pub fn notify_space(&self) {
        let _state = self.state.lock();
        self.space.notify_all();
    }

    /// Record whether the reclaimer ran out of evictable data.
    pub fn set_exhausted(&self, exhausted: bool) {
        self.exhausted.store(exhausted, Ordering::Release);
    }

    /// Whether the last reclaim pass ran out of evictable data.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::Acquire)
    }

    /// Release every waiter for shutdown.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.reclaim.notify_all();
        self.space.notify_all();
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}
