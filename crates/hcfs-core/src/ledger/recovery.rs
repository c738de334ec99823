//! Startup normalization of a ledger after an unclean shutdown.
//!
//! Transient states cannot survive a restart: no transfer is running any
//! more. Each one is folded back into a stable state that never claims more
//! than the disk and backend actually hold.

use tracing::{error, info, warn};

use crate::block_store::BlockStore;
use crate::error::{BlockError, BlockResult};
use crate::status::{BlockRecord, BlockStatus};
use crate::{BlockIndex, InodeId};

use super::Ledger;

/// What [`Ledger::normalize`] changed for one inode.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Interrupted uploads folded back to `Local`.
    pub reverted_uploads: usize,
    /// Interrupted downloads folded back to `Cloud`.
    pub reverted_downloads: usize,
    /// Records whose local file vanished.
    pub lost_local: usize,
    /// Stray local files removed.
    pub stray_files_removed: usize,
    /// Blocks whose remote object may be a partial upload and should be
    /// deleted before anything else touches them.
    pub cleanup_deletes: Vec<BlockIndex>,
    /// Whether the inode still has `Local` or `Deleted` work for the sync
    /// scheduler.
    pub needs_sync: bool,
}

impl RecoveryReport {
    /// Whether anything had to be changed.
    pub fn is_clean(&self) -> bool {
        self.reverted_uploads == 0
            && self.reverted_downloads == 0
            && self.lost_local == 0
            && self.stray_files_removed == 0
    }
}

impl Ledger {
    /// Normalize every record of `inode` against the files in `store`.
    ///
    /// | found                               | becomes                      |
    /// |-------------------------------------|------------------------------|
    /// | `LocalToCloud`                      | `Local`                      |
    /// | `CloudToLocal`                      | `Cloud`, partial file dropped |
    /// | `Both`, local file missing          | `Cloud`                      |
    /// | `Local`, file missing, no remote    | purged                       |
    /// | `Local`, file missing, stale remote | `Deleted`                    |
    /// | `Cloud`/`Deleted` with a local file | local file removed           |
    pub fn normalize(&self, inode: InodeId, store: &BlockStore) -> BlockResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let Some(mut guard) = self.try_lock_existing(inode)? else {
            return Ok(report);
        };

        for (block, record) in guard.records()? {
            let file_present = store.exists(inode, block);
            match record.status {
                BlockStatus::LocalToCloud => {
                    if !file_present {
                        lost_local(&mut guard, inode, block, record, &mut report)?;
                        continue;
                    }
                    if record.object_version.is_none() {
                        report.cleanup_deletes.push(block);
                    }
                    guard.set_record(
                        block,
                        BlockRecord {
                            status: BlockStatus::Local,
                            prior: BlockStatus::None,
                            ..record
                        },
                    )?;
                    report.reverted_uploads += 1;
                }
                BlockStatus::CloudToLocal => {
                    store.discard_staged(inode, block)?;
                    if file_present {
                        store.remove(inode, block)?;
                    }
                    guard.set_record(
                        block,
                        BlockRecord {
                            status: BlockStatus::Cloud,
                            prior: BlockStatus::None,
                            ..record
                        },
                    )?;
                    report.reverted_downloads += 1;
                }
                BlockStatus::Both | BlockStatus::Local if !file_present => {
                    lost_local(&mut guard, inode, block, record, &mut report)?;
                }
                BlockStatus::Cloud | BlockStatus::Deleted => {
                    let staged = store.discard_staged(inode, block)?;
                    let stray = store.remove(inode, block)?;
                    if staged || stray {
                        report.stray_files_removed += 1;
                    }
                }
                BlockStatus::None | BlockStatus::Local | BlockStatus::Both => {}
            }
        }

        report.needs_sync = guard
            .records()?
            .iter()
            .any(|(_, r)| matches!(r.status, BlockStatus::Local | BlockStatus::Deleted))
            || guard.header().is_unlinked();

        if !report.is_clean() {
            info!(
                inode,
                reverted_uploads = report.reverted_uploads,
                reverted_downloads = report.reverted_downloads,
                lost_local = report.lost_local,
                stray_files = report.stray_files_removed,
                "Recovered ledger"
            );
        }
        Ok(report)
    }
}

fn lost_local(
    guard: &mut super::LedgerGuard<'_>,
    inode: InodeId,
    block: BlockIndex,
    record: BlockRecord,
    report: &mut RecoveryReport,
) -> BlockResult<()> {
    report.lost_local += 1;
    let status = record.status;
    let err = BlockError::consistency(inode, block, format!("local file missing for {status} block"));
    if status == BlockStatus::Both {
        warn!(inode, block, "Local copy missing, block is cloud-only again");
        guard.set_record(
            block,
            BlockRecord {
                status: BlockStatus::Cloud,
                prior: BlockStatus::None,
                ..record
            },
        )?;
    } else if record.object_version.is_some() {
        error!(inode, block, error = %err, "Dirty block lost, scheduling delete of stale remote copy");
        guard.set_record(
            block,
            BlockRecord {
                status: BlockStatus::Deleted,
                prior: BlockStatus::None,
                ..record
            },
        )?;
    } else {
        error!(inode, block, error = %err, "Dirty block lost, purging record");
        guard.purge(block)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::HashedLayout;
    use std::num::NonZeroU64;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn setup(tmp: &TempDir) -> (Ledger, BlockStore) {
        let layout = Arc::new(HashedLayout::new(
            tmp.path().join("meta"),
            tmp.path().join("blocks"),
            4,
        ));
        layout.ensure_dirs().unwrap();
        (
            Ledger::new(layout.clone(), false),
            BlockStore::new(layout, false),
        )
    }

    fn record(status: BlockStatus, version: Option<u64>) -> BlockRecord {
        BlockRecord {
            status,
            prior: BlockStatus::None,
            size: 3,
            object_version: version.and_then(NonZeroU64::new),
            modified_ms: 0,
        }
    }

    #[test]
    fn test_transient_states_are_folded() {
        let tmp = TempDir::new().unwrap();
        let (ledger, store) = setup(&tmp);
        {
            let mut guard = ledger.lock(1).unwrap();
            guard.set_record(0, record(BlockStatus::LocalToCloud, None)).unwrap();
            guard.set_record(1, record(BlockStatus::LocalToCloud, Some(4))).unwrap();
            guard.set_record(2, record(BlockStatus::CloudToLocal, Some(2))).unwrap();
        }
        store.write(1, 0, b"abc").unwrap();
        store.write(1, 1, b"abc").unwrap();
        store.create_staging(1, 2).unwrap();

        let report = ledger.normalize(1, &store).unwrap();
        assert_eq!(report.reverted_uploads, 2);
        assert_eq!(report.reverted_downloads, 1);
        assert_eq!(report.cleanup_deletes, vec![0]);
        assert!(report.needs_sync);

        let guard = ledger.lock(1).unwrap();
        assert_eq!(guard.record(0).unwrap().status, BlockStatus::Local);
        let reverted = guard.record(1).unwrap();
        assert_eq!(reverted.status, BlockStatus::Local);
        assert_eq!(reverted.object_version, NonZeroU64::new(4));
        assert_eq!(guard.record(2).unwrap().status, BlockStatus::Cloud);
        assert!(!store.staging_path(1, 2).exists());
    }

    #[test]
    fn test_missing_local_files() {
        let tmp = TempDir::new().unwrap();
        let (ledger, store) = setup(&tmp);
        {
            let mut guard = ledger.lock(2).unwrap();
            guard.set_record(0, record(BlockStatus::Both, Some(1))).unwrap();
            guard.set_record(1, record(BlockStatus::Local, None)).unwrap();
            guard.set_record(2, record(BlockStatus::Local, Some(3))).unwrap();
        }

        let report = ledger.normalize(2, &store).unwrap();
        assert_eq!(report.lost_local, 3);

        let guard = ledger.lock(2).unwrap();
        assert_eq!(guard.record(0).unwrap().status, BlockStatus::Cloud);
        assert_eq!(guard.record(1).unwrap().status, BlockStatus::None);
        assert_eq!(guard.record(2).unwrap().status, BlockStatus::Deleted);
    }

    #[test]
    fn test_stray_file_under_cloud_record() {
        let tmp = TempDir::new().unwrap();
        let (ledger, store) = setup(&tmp);
        ledger
            .lock(3)
            .unwrap()
            .set_record(0, record(BlockStatus::Cloud, Some(1)))
            .unwrap();
        store.write(3, 0, b"old").unwrap();

        let report = ledger.normalize(3, &store).unwrap();
        assert_eq!(report.stray_files_removed, 1);
        assert!(!report.needs_sync);
        assert!(!store.exists(3, 0));
    }

    #[test]
    fn test_clean_ledger_is_untouched() {
        let tmp = TempDir::new().unwrap();
        let (ledger, store) = setup(&tmp);
        ledger
            .lock(4)
            .unwrap()
            .set_record(0, record(BlockStatus::Both, Some(1)))
            .unwrap();
        store.write(4, 0, b"abc").unwrap();
        let version = ledger.lock(4).unwrap().header().version;

        let report = ledger.normalize(4, &store).unwrap();
        assert!(report.is_clean());
        assert_eq!(ledger.lock(4).unwrap().header().version, version);
    }
}
