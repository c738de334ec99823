//! Block status ledger.
//!
//! Every inode owns one meta file holding a [`BlockRecord`] per block. The
//! ledger is the durable source of truth for where a block's bytes live.
//! All reads and writes of an inode's records happen through a
//! [`LedgerGuard`], which holds that inode's exclusive lock for its whole
//! lifetime, so status changes of one inode are totally ordered.
//!
//! # Lock registry
//!
//! Locks live in a `DashMap<InodeId, Arc<Mutex<()>>>`. The guard owns an
//! `Arc`-backed mutex guard, so no DashMap shard lock is held while a caller
//! works on the inode. Entries are dropped when the meta file is removed and
//! nobody else holds or waits on the lock.

mod meta_file;
mod recovery;

pub use meta_file::{FLAG_PINNED, FLAG_UNLINKED, HEADER_SIZE, LedgerHeader, MAGIC, RECORDS_PER_PAGE};
pub use recovery::RecoveryReport;

use std::fs;
use std::io;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex, RwLock};
use tracing::{debug, trace};

use crate::error::{BlockError, BlockResult};
use crate::layout::{PathResolver, parse_meta_file_name};
use crate::status::{BlockRecord, BlockStatus};
use crate::{BlockIndex, InodeId};

use meta_file::MetaFile;

/// Receives every committed status change.
pub trait TransitionObserver: Send + Sync {
    /// Called after the record change is on disk, with the inode lock held.
    fn on_transition(&self, inode: InodeId, block: BlockIndex, from: BlockStatus, to: BlockStatus);
}

/// Owner of all meta files and their per-inode locks.
pub struct Ledger {
    resolver: Arc<dyn PathResolver>,
    locks: DashMap<InodeId, Arc<Mutex<()>>>,
    fsync: bool,
    observer: RwLock<Option<Arc<dyn TransitionObserver>>>,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("locked_inodes", &self.locks.len())
            .field("fsync", &self.fsync)
            .finish_non_exhaustive()
    }
}

impl Ledger {
    /// Create a ledger over the meta files named by `resolver`.
    pub fn new(resolver: Arc<dyn PathResolver>, fsync: bool) -> Self {
        Self {
            resolver,
            locks: DashMap::new(),
            fsync,
            observer: RwLock::new(None),
        }
    }

    /// Install the transition observer, replacing any previous one.
    pub fn set_observer(&self, observer: Arc<dyn TransitionObserver>) {
        *self.observer.write() = Some(observer);
    }

    fn lock_inode(&self, inode: InodeId) -> ArcMutexGuard<RawMutex, ()> {
        let mutex = Arc::clone(self.locks.entry(inode).or_default().value());
        mutex.lock_arc()
    }

    /// Lock `inode`, creating its meta file if it does not exist yet.
    pub fn lock(&self, inode: InodeId) -> BlockResult<LedgerGuard<'_>> {
        let lock = self.lock_inode(inode);
        let path = self.resolver.path_for_inode_meta(inode);
        let (meta, created) = match self.open_meta(inode, &path)? {
            Some(meta) => (meta, false),
            None => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).map_err(|e| {
                        BlockError::local_io(format!("creating meta directory for inode {inode}"), e)
                    })?;
                }
                let meta = MetaFile::create(&path, inode, self.fsync).map_err(|e| {
                    BlockError::local_io(format!("creating meta file for inode {inode}"), e)
                })?;
                debug!(inode, "Created meta file");
                (meta, true)
            }
        };
        Ok(LedgerGuard {
            ledger: self,
            inode,
            meta,
            created,
            _lock: lock,
        })
    }

    /// Lock `inode` only if its meta file already exists.
    pub fn try_lock_existing(&self, inode: InodeId) -> BlockResult<Option<LedgerGuard<'_>>> {
        let lock = self.lock_inode(inode);
        let path = self.resolver.path_for_inode_meta(inode);
        Ok(self.open_meta(inode, &path)?.map(|meta| LedgerGuard {
            ledger: self,
            inode,
            meta,
            created: false,
            _lock: lock,
        }))
    }

    fn open_meta(&self, inode: InodeId, path: &std::path::Path) -> BlockResult<Option<MetaFile>> {
        match MetaFile::open(path, inode, self.fsync) {
            Ok(Ok(meta)) => Ok(Some(meta)),
            Ok(Err(detail)) => Err(BlockError::CorruptLedger { inode, detail }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BlockError::local_io(format!("opening meta file for inode {inode}"), e)),
        }
    }

    /// Whether `inode` has a meta file.
    pub fn exists(&self, inode: InodeId) -> bool {
        self.resolver.path_for_inode_meta(inode).is_file()
    }

    /// Every inode with a meta file, sorted.
    pub fn inodes(&self) -> BlockResult<Vec<InodeId>> {
        let mut inodes = Vec::new();
        for dir in self.resolver.meta_dirs() {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(BlockError::local_io(format!("scanning {}", dir.display()), e));
                }
            };
            for entry in entries {
                let entry =
                    entry.map_err(|e| BlockError::local_io(format!("scanning {}", dir.display()), e))?;
                if let Some(inode) = entry.file_name().to_str().and_then(parse_meta_file_name) {
                    inodes.push(inode);
                }
            }
        }
        inodes.sort_unstable();
        Ok(inodes)
    }

    fn notify(&self, inode: InodeId, block: BlockIndex, from: BlockStatus, to: BlockStatus) {
        if let Some(observer) = self.observer.read().as_ref() {
            observer.on_transition(inode, block, from, to);
        }
    }
}

/// Exclusive access to one inode's records.
pub struct LedgerGuard<'a> {
    ledger: &'a Ledger,
    inode: InodeId,
    meta: MetaFile,
    created: bool,
    _lock: ArcMutexGuard<RawMutex, ()>,
}

impl std::fmt::Debug for LedgerGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerGuard")
            .field("inode", &self.inode)
            .field("header", &self.meta.header())
            .finish_non_exhaustive()
    }
}

impl LedgerGuard<'_> {
    /// The locked inode.
    pub fn inode(&self) -> InodeId {
        self.inode
    }

    /// Whether this guard created the meta file.
    pub fn created(&self) -> bool {
        self.created
    }

    /// Current header.
    pub fn header(&self) -> LedgerHeader {
        self.meta.header()
    }

    fn corrupt(&self, block: BlockIndex) -> BlockError {
        BlockError::CorruptLedger {
            inode: self.inode,
            detail: format!("unknown status code in record {block}"),
        }
    }

    fn io_error(&self, what: &str, e: io::Error) -> BlockError {
        BlockError::local_io(format!("{what} ledger of inode {}", self.inode), e)
    }

    /// Record of `block`; vacant if never written.
    pub fn record(&self, block: BlockIndex) -> BlockResult<BlockRecord> {
        self.meta
            .read_record(block)
            .map_err(|e| self.io_error("reading", e))?
            .ok_or_else(|| self.corrupt(block))
    }

    /// Every non-vacant record in block order.
    pub fn records(&self) -> BlockResult<Vec<(BlockIndex, BlockRecord)>> {
        let raw = self.meta.read_all().map_err(|e| self.io_error("reading", e))?;
        let mut out = Vec::new();
        for (block, record) in (0..).zip(raw) {
            let record = record.ok_or_else(|| self.corrupt(block))?;
            if record.status != BlockStatus::None {
                out.push((block, record));
            }
        }
        Ok(out)
    }

    /// Write `record` without checking the transition.
    ///
    /// Used by recovery, which must be able to force conservative states.
    pub fn set_record(&mut self, block: BlockIndex, record: BlockRecord) -> BlockResult<BlockRecord> {
        let previous = self.record(block)?;
        if previous == record {
            return Ok(previous);
        }
        self.meta
            .write_record(block, &record)
            .map_err(|e| self.io_error("writing", e))?;
        if previous.status != record.status {
            trace!(
                inode = self.inode,
                block,
                from = %previous.status,
                to = %record.status,
                version = self.meta.header().version,
                "Block status transition"
            );
            self.ledger
                .notify(self.inode, block, previous.status, record.status);
        }
        Ok(previous)
    }

    /// Apply `update` to the record of `block` and commit it.
    ///
    /// Fails with a consistency error when the status change is not a legal
    /// transition. Returns the record as it was before.
    pub fn transition(
        &mut self,
        block: BlockIndex,
        update: impl FnOnce(&mut BlockRecord),
    ) -> BlockResult<BlockRecord> {
        let current = self.record(block)?;
        let mut next = current;
        update(&mut next);
        if !current.status.can_transition_to(next.status) {
            return Err(BlockError::consistency(
                self.inode,
                block,
                format!("illegal transition {} -> {}", current.status, next.status),
            ));
        }
        self.set_record(block, next)
    }

    /// Reset `block` to a vacant slot.
    pub fn purge(&mut self, block: BlockIndex) -> BlockResult<BlockRecord> {
        self.set_record(block, BlockRecord::default())
    }

    /// Set or clear the pinned flag.
    pub fn set_pinned(&mut self, pinned: bool) -> BlockResult<()> {
        self.meta
            .set_flag(FLAG_PINNED, pinned)
            .map_err(|e| self.io_error("writing", e))
    }

    /// Flag the inode as deleted.
    pub fn mark_unlinked(&mut self) -> BlockResult<()> {
        self.meta
            .set_flag(FLAG_UNLINKED, true)
            .map_err(|e| self.io_error("writing", e))
    }

    /// Raw meta file contents.
    pub fn snapshot(&self) -> BlockResult<Vec<u8>> {
        self.meta.snapshot().map_err(|e| self.io_error("reading", e))
    }

    /// Delete the meta file and release the lock.
    pub fn remove_file(self) -> BlockResult<()> {
        let inode = self.inode;
        let path = self.ledger.resolver.path_for_inode_meta(inode);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(self.io_error("removing", e)),
        }
        debug!(inode, "Removed meta file");
        // Map reference plus the one in our guard.
        self.ledger
            .locks
            .remove_if(&inode, |_, mutex| Arc::strong_count(mutex) == 2);
        Ok(())
    }
}
