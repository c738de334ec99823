//! Bounded pool of backend connections.
//!
//! A [`TransferPool`] owns a fixed arena of connection slots and a free list
//! of slot indices. [`TransferPool::acquire`] blocks until a slot is free,
//! which caps concurrency the way a counting semaphore would, and returns a
//! [`PooledConnection`] that hands the slot back when dropped, including
//! during unwinding. While a slot is out, the pool's task table records what
//! it is used for.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::backend::{BackendConnection, BackendError, ObjectBackend};
use crate::{BlockIndex, InodeId};

/// What a pool slot is being used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKind {
    /// Block upload.
    Upload,
    /// Block download.
    Download,
    /// Remote block delete.
    Delete,
    /// Meta file snapshot upload or delete.
    Meta,
}

/// An active transfer occupying a pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferTask {
    /// Inode being transferred.
    pub inode: InodeId,
    /// Block being transferred; zero for meta transfers.
    pub block: BlockIndex,
    /// Slot index in the pool arena.
    pub slot: usize,
    /// Operation kind.
    pub kind: TransferKind,
}

/// Counters of a [`TransferPool`].
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Successful acquisitions.
    pub acquired: AtomicU64,
    /// Acquisitions that had to wait for a free slot.
    pub contended: AtomicU64,
    /// Connections opened.
    pub connects: AtomicU64,
    /// Connections thrown away after a failure.
    pub discarded: AtomicU64,
}

struct PoolState {
    free: Vec<usize>,
    connections: Vec<Option<Box<dyn BackendConnection>>>,
    tasks: Vec<Option<TransferTask>>,
}

/// Fixed-capacity connection pool for one transfer category.
pub struct TransferPool {
    name: &'static str,
    backend: Arc<dyn ObjectBackend>,
    state: Mutex<PoolState>,
    available: Condvar,
    stats: PoolStats,
}

impl std::fmt::Debug for TransferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferPool")
            .field("name", &self.name)
            .field("capacity", &self.capacity())
            .field("in_use", &self.in_use())
            .finish_non_exhaustive()
    }
}

impl TransferPool {
    /// Create a pool of `capacity` slots. Connections are opened lazily.
    pub fn new(name: &'static str, backend: Arc<dyn ObjectBackend>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name,
            backend,
            state: Mutex::new(PoolState {
                free: (0..capacity).rev().collect(),
                connections: (0..capacity).map(|_| None).collect(),
                tasks: vec![None; capacity],
            }),
            available: Condvar::new(),
            stats: PoolStats::default(),
        }
    }

    /// Pool name used in logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.state.lock().tasks.len()
    }

    /// Slots currently handed out.
    pub fn in_use(&self) -> usize {
        let state = self.state.lock();
        state.tasks.len() - state.free.len()
    }

    /// Pool counters.
    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// Every active transfer.
    pub fn active_tasks(&self) -> Vec<TransferTask> {
        self.state.lock().tasks.iter().flatten().copied().collect()
    }

    /// Number of active transfers for `inode`.
    pub fn in_flight_for(&self, inode: InodeId) -> usize {
        self.state
            .lock()
            .tasks
            .iter()
            .flatten()
            .filter(|t| t.inode == inode)
            .count()
    }

    /// Claim a slot for `(inode, block, kind)`, blocking until one is free.
    ///
    /// The slot's connection is opened on first use, or reopened if the
    /// previous holder discarded it.
    pub fn acquire(
        &self,
        inode: InodeId,
        block: BlockIndex,
        kind: TransferKind,
    ) -> Result<PooledConnection<'_>, BackendError> {
        let (slot, existing) = {
            let mut state = self.state.lock();
            if state.free.is_empty() {
                self.stats.contended.fetch_add(1, Ordering::Relaxed);
                trace!(pool = self.name, inode, block, "Waiting for transfer slot");
            }
            let slot = loop {
                if let Some(slot) = state.free.pop() {
                    break slot;
                }
                self.available.wait(&mut state);
            };
            state.tasks[slot] = Some(TransferTask {
                inode,
                block,
                slot,
                kind,
            });
            (slot, state.connections[slot].take())
        };

        let mut guard = PooledConnection {
            pool: self,
            slot,
            conn: None,
            discard: false,
        };
        let conn = match existing {
            Some(conn) => conn,
            None => {
                // Connect outside the state lock; on failure the guard
                // returns the slot.
                let conn = self.backend.connect()?;
                self.stats.connects.fetch_add(1, Ordering::Relaxed);
                debug!(pool = self.name, slot, "Opened backend connection");
                conn
            }
        };
        guard.conn = Some(conn);
        self.stats.acquired.fetch_add(1, Ordering::Relaxed);
        Ok(guard)
    }

    fn release(&self, slot: usize, conn: Option<Box<dyn BackendConnection>>) {
        let mut state = self.state.lock();
        state.connections[slot] = conn;
        state.tasks[slot] = None;
        state.free.push(slot);
        drop(state);
        self.available.notify_one();
    }
}

/// A claimed pool slot and its connection.
pub struct PooledConnection<'a> {
    pool: &'a TransferPool,
    slot: usize,
    conn: Option<Box<dyn BackendConnection>>,
    discard: bool,
}

impl PooledConnection<'_> {
    /// Slot index in the pool arena.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Drop the connection instead of returning it, so the next holder of
    /// this slot starts with a fresh one.
    pub fn discard(&mut self) {
        self.discard = true;
    }
}

impl Deref for PooledConnection<'_> {
    type Target = dyn BackendConnection;

    fn deref(&self) -> &Self::Target {
        self.conn
            .as_deref()
            .unwrap_or_else(|| unreachable!("pooled connection used after release"))
    }
}

impl DerefMut for PooledConnection<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn
            .as_deref_mut()
            .unwrap_or_else(|| unreachable!("pooled connection used after release"))
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        let conn = if self.discard {
            self.pool.stats.discarded.fetch_add(1, Ordering::Relaxed);
            None
        } else {
            self.conn.take()
        };
        self.pool.release(self.slot, conn);
    }
}
