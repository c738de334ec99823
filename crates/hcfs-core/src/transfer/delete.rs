//! Remote delete path.

use tracing::{debug, warn};

use crate::error::BlockResult;
use crate::status::BlockStatus;
use crate::{BlockIndex, InodeId};

use super::{TransferEngine, bump};

/// Result of [`TransferEngine::delete_block_object`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The remote object is gone and the record purged.
    Purged,
    /// The block was rewritten after the delete was requested; its stale
    /// remote object is gone but the record stays.
    Detached,
    /// The block is not `Deleted`; nothing to do.
    Skipped,
}

impl TransferEngine {
    /// Remove the remote object of a `Deleted` block and purge its record.
    ///
    /// Deleting an object that is already absent counts as success. On
    /// failure the record stays `Deleted` so a later sync pass retries.
    pub fn delete_block_object(&self, inode: InodeId, block: BlockIndex) -> BlockResult<DeleteOutcome> {
        {
            let Some(mut guard) = self.ledger.try_lock_existing(inode)? else {
                return Ok(DeleteOutcome::Skipped);
            };
            let record = guard.record(block)?;
            if record.status != BlockStatus::Deleted {
                return Ok(DeleteOutcome::Skipped);
            }
            if !record.has_remote_object() {
                guard.purge(block)?;
                return Ok(DeleteOutcome::Purged);
            }
        }

        if let Err(e) = self.delete_remote(inode, block) {
            bump(&self.stats.delete_failures);
            warn!(inode, block, error = %e, "Remote delete failed, will retry");
            return Err(e);
        }
        bump(&self.stats.deletes);

        let guard = self.ledger.try_lock_existing(inode)?;
        self.accounting.update(|acct| {
            acct.backend_objects = acct.backend_objects.saturating_sub(1);
        });
        let Some(mut guard) = guard else {
            return Ok(DeleteOutcome::Purged);
        };
        let current = guard.record(block)?;
        if current.status == BlockStatus::Deleted {
            guard.purge(block)?;
            debug!(inode, block, "Deleted remote block");
            Ok(DeleteOutcome::Purged)
        } else {
            guard.transition(block, |r| r.object_version = None)?;
            debug!(inode, block, status = %current.status, "Block rewritten during delete");
            Ok(DeleteOutcome::Detached)
        }
    }
}
