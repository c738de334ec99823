//! Physical block files on local disk.
//!
//! Plain reads and writes of block payloads at the paths given by a
//! [`PathResolver`]. Writes go to a temporary file in the same directory and
//! are renamed over the block. Downloads land in a `.partial` staging file
//! first and are renamed into place only once the ledger agrees.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tempfile::NamedTempFile;

use crate::error::{BlockError, BlockResult};
use crate::layout::PathResolver;
use crate::{BlockIndex, InodeId};

/// Local block file storage.
#[derive(Clone)]
pub struct BlockStore {
    resolver: Arc<dyn PathResolver>,
    fsync: bool,
}

impl std::fmt::Debug for BlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockStore")
            .field("fsync", &self.fsync)
            .finish_non_exhaustive()
    }
}

impl BlockStore {
    /// Create a store over `resolver`.
    pub fn new(resolver: Arc<dyn PathResolver>, fsync: bool) -> Self {
        Self { resolver, fsync }
    }

    /// Path of the block's data file.
    pub fn path(&self, inode: InodeId, block: BlockIndex) -> PathBuf {
        self.resolver.path_for_block(inode, block)
    }

    /// Path of the block's download staging file.
    pub fn staging_path(&self, inode: InodeId, block: BlockIndex) -> PathBuf {
        let mut name = OsString::from(self.path(inode, block).into_os_string());
        name.push(".partial");
        PathBuf::from(name)
    }

    /// Read the whole block.
    pub fn read(&self, inode: InodeId, block: BlockIndex) -> BlockResult<Bytes> {
        fs::read(self.path(inode, block))
            .map(Bytes::from)
            .map_err(|e| BlockError::local_io(format!("reading block {inode}/{block}"), e))
    }

    /// Replace the block's contents atomically.
    pub fn write(&self, inode: InodeId, block: BlockIndex, data: &[u8]) -> BlockResult<()> {
        let path = self.path(inode, block);
        write_file(&path, data, self.fsync)
            .map_err(|e| BlockError::local_io(format!("writing block {inode}/{block}"), e))
    }

    /// Delete the block file. Returns whether a file was removed.
    pub fn remove(&self, inode: InodeId, block: BlockIndex) -> BlockResult<bool> {
        remove_if_exists(self.path(inode, block))
            .map_err(|e| BlockError::local_io(format!("removing block {inode}/{block}"), e))
    }

    /// Whether the block file exists.
    pub fn exists(&self, inode: InodeId, block: BlockIndex) -> bool {
        self.path(inode, block).is_file()
    }

    /// Size of the block file, if it exists.
    pub fn size(&self, inode: InodeId, block: BlockIndex) -> Option<u64> {
        fs::metadata(self.path(inode, block)).ok().map(|m| m.len())
    }

    /// Create (truncating) the staging file a download writes into.
    pub fn create_staging(&self, inode: InodeId, block: BlockIndex) -> BlockResult<File> {
        let path = self.staging_path(inode, block);
        File::create(&path)
            .map_err(|e| BlockError::local_io(format!("creating staging file for {inode}/{block}"), e))
    }

    /// Move a finished download into place.
    pub fn commit_staged(&self, inode: InodeId, block: BlockIndex) -> BlockResult<()> {
        fs::rename(self.staging_path(inode, block), self.path(inode, block))
            .map_err(|e| BlockError::local_io(format!("committing download of {inode}/{block}"), e))
    }

    /// Drop a partial download. Returns whether a staging file existed.
    pub fn discard_staged(&self, inode: InodeId, block: BlockIndex) -> BlockResult<bool> {
        remove_if_exists(self.staging_path(inode, block))
            .map_err(|e| BlockError::local_io(format!("discarding download of {inode}/{block}"), e))
    }

    /// Whether block and staging writes are fsynced.
    pub fn fsync(&self) -> bool {
        self.fsync
    }
}

/// Write next to `path` and rename over it, so a crash mid-write leaves
/// the previous contents in place.
fn write_file(path: &Path, data: &[u8], fsync: bool) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    if fsync {
        tmp.as_file().sync_data()?;
    }
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn remove_if_exists(path: PathBuf) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
