//! Mapping of inodes and blocks to local paths.
//!
//! Meta and block files are spread over a fixed number of `sub_<n>`
//! directories so no single directory grows without bound.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::{BlockIndex, InodeId};

/// Resolves the local paths of meta files and block files.
pub trait PathResolver: Send + Sync {
    /// Path of the meta file (ledger) for `inode`.
    fn path_for_inode_meta(&self, inode: InodeId) -> PathBuf;

    /// Path of the data file for block `block` of `inode`.
    fn path_for_block(&self, inode: InodeId, block: BlockIndex) -> PathBuf;

    /// Every directory that may hold meta files.
    fn meta_dirs(&self) -> Vec<PathBuf>;
}

/// Hash-bucketed layout used by HCFS.
///
/// - meta:  `<meta_root>/sub_<inode % subdirs>/meta<inode>`
/// - block: `<block_root>/sub_<(inode + block) % subdirs>/data_<inode>_<block>`
#[derive(Debug, Clone)]
pub struct HashedLayout {
    meta_root: PathBuf,
    block_root: PathBuf,
    subdirs: u64,
}

impl HashedLayout {
    /// Create a layout; `subdirs` must be non-zero.
    pub fn new(meta_root: impl Into<PathBuf>, block_root: impl Into<PathBuf>, subdirs: u64) -> Self {
        Self {
            meta_root: meta_root.into(),
            block_root: block_root.into(),
            subdirs: subdirs.max(1),
        }
    }

    /// Create every `sub_<n>` directory under both roots.
    pub fn ensure_dirs(&self) -> io::Result<()> {
        for n in 0..self.subdirs {
            fs::create_dir_all(self.meta_root.join(format!("sub_{n}")))?;
            fs::create_dir_all(self.block_root.join(format!("sub_{n}")))?;
        }
        Ok(())
    }

    /// Root directory of the meta files.
    pub fn meta_root(&self) -> &Path {
        &self.meta_root
    }

    /// Root directory of the block files.
    pub fn block_root(&self) -> &Path {
        &self.block_root
    }
}

impl PathResolver for HashedLayout {
    fn path_for_inode_meta(&self, inode: InodeId) -> PathBuf {
        self.meta_root
            .join(format!("sub_{}", inode % self.subdirs))
            .join(format!("meta{inode}"))
    }

    fn path_for_block(&self, inode: InodeId, block: BlockIndex) -> PathBuf {
        let bucket = inode.wrapping_add(block) % self.subdirs;
        self.block_root
            .join(format!("sub_{bucket}"))
            .join(format!("data_{inode}_{block}"))
    }

    fn meta_dirs(&self) -> Vec<PathBuf> {
        (0..self.subdirs)
            .map(|n| self.meta_root.join(format!("sub_{n}")))
            .collect()
    }
}

/// Parse the inode number out of a meta file name (`meta<inode>`).
pub fn parse_meta_file_name(name: &str) -> Option<InodeId> {
    name.strip_prefix("meta")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_paths_are_bucketed() {
        let layout = HashedLayout::new("/m", "/b", 1000);
        assert_eq!(
            layout.path_for_inode_meta(1234),
            Path::new("/m/sub_234/meta1234")
        );
        assert_eq!(
            layout.path_for_block(1234, 7),
            Path::new("/b/sub_241/data_1234_7")
        );
    }

    #[test]
    fn test_ensure_dirs_creates_buckets() {
        let tmp = TempDir::new().unwrap();
        let layout = HashedLayout::new(tmp.path().join("m"), tmp.path().join("b"), 4);
        layout.ensure_dirs().unwrap();
        for n in 0..4 {
            assert!(tmp.path().join(format!("m/sub_{n}")).is_dir());
            assert!(tmp.path().join(format!("b/sub_{n}")).is_dir());
        }
        assert_eq!(layout.meta_dirs().len(), 4);
    }

    #[test]
    fn test_parse_meta_file_name() {
        assert_eq!(parse_meta_file_name("meta42"), Some(42));
        assert_eq!(parse_meta_file_name("meta42.tmp"), None);
        assert_eq!(parse_meta_file_name("data_1_2"), None);
    }
}
