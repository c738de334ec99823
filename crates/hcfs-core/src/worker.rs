//! Fixed pool of worker threads fed by a bounded queue.
//!
//! Each transfer category (upload, download, delete) gets its own
//! [`WorkerPool`]. Submission blocks while the queue is full. Shutdown closes
//! the queue; workers finish every job already queued and exit, and
//! [`WorkerPool::join`] waits for them.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;
use tracing::{debug, error, info};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Error when submitting to a worker pool.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// The pool has been shut down.
    #[error("worker pool {0} has been shut down")]
    Shutdown(&'static str),
}

/// Counters of a [`WorkerPool`].
#[derive(Debug, Default)]
pub struct WorkerStats {
    /// Jobs accepted.
    pub submitted: AtomicU64,
    /// Jobs run to completion.
    pub completed: AtomicU64,
    /// Jobs that panicked.
    pub panicked: AtomicU64,
}

impl WorkerStats {
    /// Jobs accepted but not finished.
    pub fn pending(&self) -> u64 {
        let finished = self.completed.load(Ordering::Relaxed) + self.panicked.load(Ordering::Relaxed);
        self.submitted.load(Ordering::Relaxed).saturating_sub(finished)
    }
}

/// Fixed-size thread pool.
pub struct WorkerPool {
    name: &'static str,
    submit_tx: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<WorkerStats>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("threads", &self.workers.lock().len())
            .field("pending", &self.stats.pending())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Start `threads` workers sharing a queue of `queue_capacity` jobs.
    pub fn new(name: &'static str, threads: usize, queue_capacity: usize) -> Self {
        let (submit_tx, submit_rx) = bounded::<Job>(queue_capacity.max(1));
        let stats = Arc::new(WorkerStats::default());
        let workers = (0..threads.max(1))
            .map(|worker_id| {
                let rx = submit_rx.clone();
                let stats = Arc::clone(&stats);
                thread::Builder::new()
                    .name(format!("hcfs-{name}-{worker_id}"))
                    .spawn(move || worker_loop(name, worker_id, &rx, &stats))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        info!(pool = name, threads, capacity = queue_capacity, "Worker pool started");

        Self {
            name,
            submit_tx: Mutex::new(Some(submit_tx)),
            workers: Mutex::new(workers),
            stats,
        }
    }

    /// Queue `job`, blocking while the queue is full.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> Result<(), SubmitError> {
        // Clone the sender so a full queue does not block shutdown().
        let tx = self
            .submit_tx
            .lock()
            .clone()
            .ok_or(SubmitError::Shutdown(self.name))?;
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        tx.send(Box::new(job)).map_err(|_| {
            self.stats.submitted.fetch_sub(1, Ordering::Relaxed);
            SubmitError::Shutdown(self.name)
        })
    }

    /// Pool counters.
    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Stop accepting jobs. Queued jobs still run.
    pub fn shutdown(&self) {
        if self.submit_tx.lock().take().is_some() {
            debug!(pool = self.name, "Worker pool shutting down");
        }
    }

    /// Wait for every worker to exit. Call after [`shutdown`](Self::shutdown).
    pub fn join(&self) {
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            let _ = handle.join();
        }
        info!(pool = self.name, "Worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.submit_tx.get_mut().take();
    }
}

fn worker_loop(pool: &'static str, worker_id: usize, rx: &Receiver<Job>, stats: &WorkerStats) {
    debug!(pool, worker_id, "Worker started");
    for job in rx.iter() {
        match catch_unwind(AssertUnwindSafe(job)) {
            Ok(()) => {
                stats.completed.fetch_add(1, Ordering::Relaxed);
            }
            // Transfer jobs fold their own transient ledger state back while
            // unwinding.
            Err(_) => {
                stats.panicked.fetch_add(1, Ordering::Relaxed);
                error!(pool, worker_id, "Worker job panicked");
            }
        }
    }
    debug!(pool, worker_id, "Worker exiting");
}
