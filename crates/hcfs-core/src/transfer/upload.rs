//! Upload path.

use std::num::NonZeroU64;

use tracing::{debug, warn};

use crate::backend::{ObjectId, Operation};
use crate::error::{BlockError, BlockResult};
use crate::pool::TransferKind;
use crate::status::{BlockRecord, BlockStatus};
use crate::{BlockIndex, InodeId};

use super::{TransferEngine, TransferWindow, bump, check};

/// Result of [`TransferEngine::upload_block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// The block is now `Both` at this object version.
    Uploaded(NonZeroU64),
    /// The block was not `Local`; nothing to do.
    Skipped,
    /// The PUT succeeded but the block was rewritten or deleted meanwhile;
    /// the inode needs another sync pass.
    Superseded,
}

impl TransferEngine {
    /// Upload one `Local` block and mark it `Both`.
    ///
    /// The bytes are snapshotted under the inode lock, so a concurrent
    /// rewrite cannot tear the uploaded object. On failure the block goes
    /// back to `Local`; if no earlier version of the object existed, the
    /// possibly partial object is deleted first. When that delete fails too,
    /// the record keeps a version marker for the object that may exist.
    pub fn upload_block(&self, inode: InodeId, block: BlockIndex) -> BlockResult<UploadOutcome> {
        let (data, start) = {
            let Some(mut guard) = self.ledger.try_lock_existing(inode)? else {
                return Ok(UploadOutcome::Skipped);
            };
            let record = guard.record(block)?;
            if record.status != BlockStatus::Local {
                return Ok(UploadOutcome::Skipped);
            }
            let data = self.store.read(inode, block)?;
            guard.transition(block, |r| {
                r.prior = BlockStatus::Local;
                r.status = BlockStatus::LocalToCloud;
            })?;
            (data, record)
        };

        let window = TransferWindow::open(self, inode, block, BlockStatus::LocalToCloud);
        let id = ObjectId::Block { inode, block };
        let put = self.run_with_retry(
            &self.upload_pool,
            id,
            Operation::Put,
            TransferKind::Upload,
            |conn| check(conn.put_object(&id, &data), Operation::Put),
        );
        let size = data.len() as u64;
        let result = match put {
            Ok(()) => self.commit_upload(inode, block, &start, size),
            Err(e) => Err(self.abort_upload(inode, block, &start, e)),
        };
        window.close();
        result
    }

    fn commit_upload(
        &self,
        inode: InodeId,
        block: BlockIndex,
        start: &BlockRecord,
        size: u64,
    ) -> BlockResult<UploadOutcome> {
        let version = start.next_object_version();
        let new_object = start.object_version.is_none();

        let Some(mut guard) = self.ledger.try_lock_existing(inode)? else {
            self.remove_orphan(inode, block);
            return Ok(UploadOutcome::Superseded);
        };
        let current = guard.record(block)?;
        let outcome = match current.status {
            BlockStatus::LocalToCloud => {
                guard.transition(block, |r| {
                    r.status = BlockStatus::Both;
                    r.prior = BlockStatus::None;
                    r.object_version = Some(version);
                })?;
                UploadOutcome::Uploaded(version)
            }
            BlockStatus::Local | BlockStatus::Deleted => {
                // The object exists now, whatever happened locally.
                guard.transition(block, |r| r.object_version = Some(version))?;
                UploadOutcome::Superseded
            }
            status => {
                drop(guard);
                warn!(inode, block, %status, "Uploaded block vanished from ledger, removing object");
                self.remove_orphan(inode, block);
                return Ok(UploadOutcome::Superseded);
            }
        };

        // Counters move while the inode lock is held, so a rewrite cannot
        // slip in between the ledger change and the tracker change.
        let uploaded = matches!(outcome, UploadOutcome::Uploaded(_));
        if uploaded {
            self.tracker.transition_dirty_to_clean(inode, size);
        }
        self.accounting.update(|acct| {
            if new_object {
                acct.backend_objects += 1;
            }
            if uploaded {
                acct.backend_size += size;
            }
        });
        drop(guard);
        bump(&self.stats.uploads);
        debug!(inode, block, bytes = size, version = version.get(), superseded = !uploaded, "Uploaded block");
        Ok(outcome)
    }

    fn abort_upload(
        &self,
        inode: InodeId,
        block: BlockIndex,
        start: &BlockRecord,
        error: BlockError,
    ) -> BlockError {
        bump(&self.stats.upload_failures);
        warn!(inode, block, error = %error, "Upload failed, reverting block to local");

        let cleaned = if start.object_version.is_none() {
            match self.delete_remote(inode, block) {
                Ok(()) => true,
                Err(e) => {
                    warn!(inode, block, error = %e, "Could not remove partial object");
                    false
                }
            }
        } else {
            // An acknowledged earlier version stays; the next upload
            // overwrites it.
            false
        };

        // A first upload whose partial object could not be removed leaves a
        // version marker behind, so a later delete still issues the DELETE.
        let marker =
            (start.object_version.is_none() && !cleaned).then(|| start.next_object_version());
        let revert = || -> BlockResult<()> {
            let Some(mut guard) = self.ledger.try_lock_existing(inode)? else {
                if marker.is_some() {
                    self.remove_orphan(inode, block);
                }
                return Ok(());
            };
            let current = guard.record(block)?;
            let mark = marker.filter(|_| current.object_version.is_none());
            match current.status {
                BlockStatus::LocalToCloud => {
                    guard.transition(block, |r| {
                        r.status = BlockStatus::Local;
                        r.prior = BlockStatus::None;
                        r.object_version = r.object_version.or(mark);
                    })?;
                }
                BlockStatus::Deleted if cleaned && !current.has_remote_object() => {
                    guard.purge(block)?;
                }
                BlockStatus::Local | BlockStatus::Deleted if mark.is_some() => {
                    guard.transition(block, |r| r.object_version = mark)?;
                }
                status => {
                    if mark.is_some() {
                        drop(guard);
                        debug!(inode, block, %status, "Failed upload no longer tracked, removing object");
                        self.remove_orphan(inode, block);
                    }
                    return Ok(());
                }
            }
            if mark.is_some() {
                self.accounting.update(|acct| acct.backend_objects += 1);
            }
            Ok(())
        };
        if let Err(e) = revert() {
            warn!(inode, block, error = %e, "Could not revert failed upload");
        }
        error
    }

    fn remove_orphan(&self, inode: InodeId, block: BlockIndex) {
        if let Err(e) = self.delete_remote(inode, block) {
            warn!(inode, block, error = %e, "Orphaned remote object left behind");
        }
    }
}
