//! Download path (`fetch_from_cloud`) with single-flight deduplication.
//!
//! When several readers miss on the same cloud block, the first becomes the
//! leader and performs the download; the rest wait for its result instead of
//! issuing their own GETs.

use std::io::Write;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::backend::{ObjectId, Operation};
use crate::error::{BlockError, BlockResult};
use crate::pool::TransferKind;
use crate::status::{BlockRecord, BlockStatus};
use crate::{BlockIndex, InodeId};

use super::{TransferEngine, TransferWindow, bump};

#[derive(Default)]
struct Flight {
    result: Mutex<Option<Result<(), BlockError>>>,
    done: Condvar,
}

impl Flight {
    fn wait(&self) -> BlockResult<()> {
        let mut result = self.result.lock();
        loop {
            if let Some(result) = result.as_ref() {
                return result.as_ref().map(|()| ()).map_err(BlockError::clone_lossy);
            }
            self.done.wait(&mut result);
        }
    }
}

/// In-flight downloads keyed by block.
#[derive(Default)]
pub(super) struct InFlightDownloads {
    flights: DashMap<(InodeId, BlockIndex), Arc<Flight>>,
}

enum Attach<'a> {
    Leader(Leader<'a>),
    Waiter(Arc<Flight>),
}

/// Completes the flight when dropped, so waiters never hang on a leader
/// that unwound.
struct Leader<'a> {
    downloads: &'a InFlightDownloads,
    key: (InodeId, BlockIndex),
    flight: Arc<Flight>,
    finished: bool,
}

impl Leader<'_> {
    fn finish(mut self, result: &BlockResult<()>) {
        self.complete(result.as_ref().map(|()| ()).map_err(BlockError::clone_lossy));
    }

    fn complete(&mut self, result: Result<(), BlockError>) {
        self.finished = true;
        self.downloads.flights.remove(&self.key);
        *self.flight.result.lock() = Some(result);
        self.flight.done.notify_all();
    }
}

impl Drop for Leader<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let (inode, block) = self.key;
            self.complete(Err(BlockError::consistency(inode, block, "download leader aborted")));
        }
    }
}

impl InFlightDownloads {
    fn attach(&self, inode: InodeId, block: BlockIndex) -> Attach<'_> {
        let key = (inode, block);
        match self.flights.entry(key) {
            Entry::Occupied(occupied) => Attach::Waiter(Arc::clone(occupied.get())),
            Entry::Vacant(vacant) => {
                let flight = Arc::new(Flight::default());
                vacant.insert(Arc::clone(&flight));
                Attach::Leader(Leader {
                    downloads: self,
                    key,
                    flight,
                    finished: false,
                })
            }
        }
    }
}

impl TransferEngine {
    /// Make a cloud-only block local again.
    ///
    /// Blocks until the block is local or the retry budget is spent. Returns
    /// `Ok` without doing anything when the block is not `Cloud` (already
    /// local, vacant or deleted). On failure the ledger is left as it was.
    pub fn fetch_from_cloud(&self, inode: InodeId, block: BlockIndex) -> BlockResult<()> {
        let leader = match self.downloads.attach(inode, block) {
            Attach::Leader(leader) => leader,
            Attach::Waiter(flight) => {
                bump(&self.stats.shared_downloads);
                return flight.wait();
            }
        };
        let result = self.download_block(inode, block);
        leader.finish(&result);
        result
    }

    fn download_block(&self, inode: InodeId, block: BlockIndex) -> BlockResult<()> {
        let record = {
            let Some(mut guard) = self.ledger.try_lock_existing(inode)? else {
                return Ok(());
            };
            let record = guard.record(block)?;
            if record.status != BlockStatus::Cloud {
                return Ok(());
            }
            guard.transition(block, |r| {
                r.prior = r.status;
                r.status = BlockStatus::CloudToLocal;
            })?;
            record
        };

        let window = TransferWindow::open(self, inode, block, BlockStatus::CloudToLocal);
        let fetched = self.download_into_staging(inode, block, &record);
        let result = self.finish_download(inode, block, fetched);
        window.close();

        match &result {
            Ok(()) => bump(&self.stats.downloads),
            Err(e) => {
                bump(&self.stats.download_failures);
                warn!(inode, block, error = %e, "Download failed");
            }
        }
        result
    }

    fn download_into_staging(
        &self,
        inode: InodeId,
        block: BlockIndex,
        record: &BlockRecord,
    ) -> BlockResult<u64> {
        let id = ObjectId::Block { inode, block };
        let data = self.run_with_retry(
            &self.download_pool,
            id,
            Operation::Get,
            TransferKind::Download,
            |conn| conn.get_object(&id),
        )?;
        let mut file = self.store.create_staging(inode, block)?;
        file.write_all(&data)
            .map_err(|e| BlockError::local_io(format!("writing download of {inode}/{block}"), e))?;
        if self.store.fsync() {
            file.sync_data()
                .map_err(|e| BlockError::local_io(format!("syncing download of {inode}/{block}"), e))?;
        }
        let size = data.len() as u64;
        if size != record.size {
            warn!(inode, block, expected = record.size, actual = size, "Remote object size differs from ledger");
        }
        Ok(size)
    }

    fn finish_download(
        &self,
        inode: InodeId,
        block: BlockIndex,
        fetched: BlockResult<u64>,
    ) -> BlockResult<()> {
        let Some(mut guard) = self.ledger.try_lock_existing(inode)? else {
            self.store.discard_staged(inode, block)?;
            return fetched.map(|_| ());
        };
        let current = guard.record(block)?;
        if current.status != BlockStatus::CloudToLocal {
            // Rewritten or deleted while the GET was in flight.
            self.store.discard_staged(inode, block)?;
            debug!(inode, block, status = %current.status, "Block changed during download, dropping fetched copy");
            return fetched.map(|_| ());
        }

        let committed = fetched.and_then(|size| {
            self.store.commit_staged(inode, block)?;
            Ok(size)
        });
        match committed {
            Ok(size) => {
                guard.transition(block, |r| {
                    r.status = BlockStatus::Both;
                    r.prior = BlockStatus::None;
                    r.size = size;
                })?;
                self.tracker.record_block_materialized(inode, size, false);
                drop(guard);
                debug!(inode, block, bytes = size, "Downloaded block");
                Ok(())
            }
            Err(e) => {
                if let Err(discard) = self.store.discard_staged(inode, block) {
                    warn!(inode, block, error = %discard, "Could not remove partial download");
                }
                guard.transition(block, |r| {
                    r.status = BlockStatus::Cloud;
                    r.prior = BlockStatus::None;
                })?;
                Err(e)
            }
        }
    }
}
