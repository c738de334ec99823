//! On-disk format of an inode's meta file.
//!
//! ```text
//! offset 0       HEADER_SIZE bytes   LedgerHeader
//! offset 64      page 0              RECORDS_PER_PAGE × RECORD_SIZE bytes
//! offset 64+3200 page 1              ...
//! ```
//!
//! Record `n` always lives at `HEADER_SIZE + n * RECORD_SIZE`, so a single
//! record can be read or rewritten with one positional I/O call. The file
//! grows one zero-filled page at a time; zero bytes decode as a vacant
//! record.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::status::{BlockRecord, RECORD_SIZE};
use crate::{BlockIndex, InodeId};

/// Magic bytes at the start of every meta file.
pub const MAGIC: [u8; 8] = *b"HCFSLDG1";

/// Size of the fixed header.
pub const HEADER_SIZE: u64 = 64;

/// Records per page.
pub const RECORDS_PER_PAGE: u64 = 100;

const PAGE_BYTES: u64 = RECORDS_PER_PAGE * RECORD_SIZE as u64;

/// The inode is exempt from eviction.
pub const FLAG_PINNED: u64 = 1;

/// The inode was deleted; the meta file goes once every record is purged.
pub const FLAG_UNLINKED: u64 = 1 << 1;

/// Fixed header of a meta file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerHeader {
    /// Owning inode.
    pub inode: InodeId,
    /// Number of record slots in use (highest written block index + 1).
    pub record_count: u64,
    /// Bumped on every committed record mutation.
    pub version: u64,
    /// `FLAG_*` bits.
    pub flags: u64,
}

impl LedgerHeader {
    /// Header of a freshly created meta file.
    pub fn new(inode: InodeId) -> Self {
        Self {
            inode,
            record_count: 0,
            version: 0,
            flags: 0,
        }
    }

    /// Whether the inode is pinned.
    pub fn is_pinned(&self) -> bool {
        self.flags & FLAG_PINNED != 0
    }

    /// Whether the inode has been unlinked.
    pub fn is_unlinked(&self) -> bool {
        self.flags & FLAG_UNLINKED != 0
    }

    fn encode(&self) -> [u8; HEADER_SIZE as usize] {
        let mut buf = [0u8; HEADER_SIZE as usize];
        buf[0..8].copy_from_slice(&MAGIC);
        buf[8..16].copy_from_slice(&self.inode.to_le_bytes());
        buf[16..24].copy_from_slice(&self.record_count.to_le_bytes());
        buf[24..32].copy_from_slice(&self.version.to_le_bytes());
        buf[32..40].copy_from_slice(&self.flags.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8; HEADER_SIZE as usize]) -> Result<Self, String> {
        if buf[0..8] != MAGIC {
            return Err("bad magic".into());
        }
        let word = |at: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[at..at + 8]);
            u64::from_le_bytes(bytes)
        };
        Ok(Self {
            inode: word(8),
            record_count: word(16),
            version: word(24),
            flags: word(32),
        })
    }
}

fn record_offset(block: BlockIndex) -> u64 {
    HEADER_SIZE + block * RECORD_SIZE as u64
}

fn pages_for(records: u64) -> u64 {
    records.div_ceil(RECORDS_PER_PAGE)
}

/// Open meta file with its cached header.
#[derive(Debug)]
pub(crate) struct MetaFile {
    file: File,
    header: LedgerHeader,
    fsync: bool,
}

impl MetaFile {
    /// Create a new, empty meta file. Fails if one already exists.
    pub(crate) fn create(path: &Path, inode: InodeId, fsync: bool) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        let meta = Self {
            file,
            header: LedgerHeader::new(inode),
            fsync,
        };
        meta.write_header()?;
        meta.sync()?;
        Ok(meta)
    }

    /// Open an existing meta file and validate its header.
    pub(crate) fn open(path: &Path, inode: InodeId, fsync: bool) -> io::Result<Result<Self, String>> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut buf = [0u8; HEADER_SIZE as usize];
        if let Err(e) = file.read_exact_at(&mut buf, 0) {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                return Ok(Err("truncated header".into()));
            }
            return Err(e);
        }
        let header = match LedgerHeader::decode(&buf) {
            Ok(h) => h,
            Err(detail) => return Ok(Err(detail)),
        };
        if header.inode != inode {
            return Ok(Err(format!("header names inode {}", header.inode)));
        }
        Ok(Ok(Self {
            file,
            header,
            fsync,
        }))
    }

    pub(crate) fn header(&self) -> LedgerHeader {
        self.header
    }

    /// Read one record; slots past `record_count` are vacant.
    pub(crate) fn read_record(&self, block: BlockIndex) -> io::Result<Option<BlockRecord>> {
        if block >= self.header.record_count {
            return Ok(Some(BlockRecord::default()));
        }
        let mut buf = [0u8; RECORD_SIZE];
        match self.file.read_exact_at(&mut buf, record_offset(block)) {
            Ok(()) => Ok(BlockRecord::decode(&buf)),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(Some(BlockRecord::default())),
            Err(e) => Err(e),
        }
    }

    /// Read every record slot in one pass.
    pub(crate) fn read_all(&self) -> io::Result<Vec<Option<BlockRecord>>> {
        let count = self.header.record_count;
        let len = usize::try_from(count * RECORD_SIZE as u64)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "record count overflow"))?;
        let mut buf = vec![0u8; len];
        self.file.read_exact_at(&mut buf, HEADER_SIZE)?;
        Ok(buf
            .chunks_exact(RECORD_SIZE)
            .map(|chunk| {
                let mut raw = [0u8; RECORD_SIZE];
                raw.copy_from_slice(chunk);
                BlockRecord::decode(&raw)
            })
            .collect())
    }

    /// Rewrite one record and bump the header version.
    pub(crate) fn write_record(&mut self, block: BlockIndex, record: &BlockRecord) -> io::Result<()> {
        if block >= self.header.record_count {
            let pages = pages_for(block + 1);
            let wanted = HEADER_SIZE + pages * PAGE_BYTES;
            if self.file.metadata()?.len() < wanted {
                self.file.set_len(wanted)?;
            }
            self.header.record_count = block + 1;
        }
        self.file.write_all_at(&record.encode(), record_offset(block))?;
        self.header.version += 1;
        self.write_header()?;
        self.sync()
    }

    pub(crate) fn set_flag(&mut self, flag: u64, on: bool) -> io::Result<()> {
        let flags = if on {
            self.header.flags | flag
        } else {
            self.header.flags & !flag
        };
        if flags == self.header.flags {
            return Ok(());
        }
        self.header.flags = flags;
        self.header.version += 1;
        self.write_header()?;
        self.sync()
    }

    /// Whole file contents, for the remote meta snapshot.
    pub(crate) fn snapshot(&self) -> io::Result<Vec<u8>> {
        let len = usize::try_from(self.file.metadata()?.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "meta file too large"))?;
        let mut buf = vec![0u8; len];
        self.file.read_exact_at(&mut buf, 0)?;
        Ok(buf)
    }

    fn write_header(&self) -> io::Result<()> {
        self.file.write_all_at(&self.header.encode(), 0)
    }

    fn sync(&self) -> io::Result<()> {
        if self.fsync {
            self.file.sync_data()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::BlockStatus;
    use tempfile::TempDir;

    #[test]
    fn test_create_then_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("meta7");
        let mut meta = MetaFile::create(&path, 7, false).unwrap();
        meta.write_record(150, &BlockRecord::local(10, None, 5)).unwrap();
        meta.set_flag(FLAG_PINNED, true).unwrap();

        let reopened = MetaFile::open(&path, 7, false).unwrap().unwrap();
        let header = reopened.header();
        assert_eq!(header.record_count, 151);
        assert_eq!(header.version, 2);
        assert!(header.is_pinned());
        assert!(!header.is_unlinked());

        // Two pages allocated for index 150.
        let len = std::fs::metadata(&path).unwrap().len();
        assert_eq!(len, HEADER_SIZE + 2 * PAGE_BYTES);

        let record = reopened.read_record(150).unwrap().unwrap();
        assert_eq!(record.status, BlockStatus::Local);
        assert_eq!(record.size, 10);
        assert_eq!(reopened.read_record(3).unwrap().unwrap(), BlockRecord::default());
        assert_eq!(reopened.read_all().unwrap().len(), 151);
    }

    #[test]
    fn test_open_rejects_foreign_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("meta1");
        std::fs::write(&path, [0xAB; 64]).unwrap();
        assert!(MetaFile::open(&path, 1, false).unwrap().is_err());

        let path = tmp.path().join("meta2");
        MetaFile::create(&path, 2, false).unwrap();
        assert!(MetaFile::open(&path, 3, false).unwrap().is_err());
    }

    #[test]
    fn test_create_refuses_existing() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("meta4");
        MetaFile::create(&path, 4, false).unwrap();
        let err = MetaFile::create(&path, 4, false).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }
}
