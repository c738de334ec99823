//! Block status state machine and the fixed-size block record.
//!
//! A block's status says where its bytes physically live. The stable states
//! are [`BlockStatus::Local`], [`BlockStatus::Cloud`] and [`BlockStatus::Both`];
//! [`BlockStatus::LocalToCloud`] and [`BlockStatus::CloudToLocal`] exist only
//! while a transfer is in flight. [`BlockStatus::Deleted`] marks a block whose
//! remote object still has to be removed before the slot is purged.
//!
//! ```text
//!   Local ──► LocalToCloud ──► Both ──► Cloud
//!     ▲            │            │  ▲      │
//!     └────────────┘            ▼  │      ▼
//!                           CloudToLocal ◄┘
//! ```

use std::num::NonZeroU64;

/// Encoded size of a [`BlockRecord`] in a meta file page.
pub const RECORD_SIZE: usize = 32;

/// Where a block's bytes currently reside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum BlockStatus {
    /// Vacant slot: the block was never written or has been purged.
    #[default]
    None = 0,
    /// Only the local copy exists; it has not been uploaded yet (dirty).
    Local = 1,
    /// Only the remote copy exists.
    Cloud = 2,
    /// Local and remote copies are identical.
    Both = 3,
    /// Upload in flight.
    LocalToCloud = 4,
    /// Download in flight.
    CloudToLocal = 5,
    /// Removed by the filesystem; the remote object is pending deletion.
    Deleted = 6,
}

impl BlockStatus {
    /// Decode an on-disk status code.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => BlockStatus::None,
            1 => BlockStatus::Local,
            2 => BlockStatus::Cloud,
            3 => BlockStatus::Both,
            4 => BlockStatus::LocalToCloud,
            5 => BlockStatus::CloudToLocal,
            6 => BlockStatus::Deleted,
            _ => return None,
        })
    }

    /// On-disk status code.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Whether a local block file exists in this state.
    pub fn has_local_copy(self) -> bool {
        matches!(
            self,
            BlockStatus::Local
                | BlockStatus::LocalToCloud
                | BlockStatus::CloudToLocal
                | BlockStatus::Both
        )
    }

    /// Whether a remote object exists in this state.
    pub fn has_remote_copy(self) -> bool {
        matches!(
            self,
            BlockStatus::Cloud | BlockStatus::LocalToCloud | BlockStatus::Both
        )
    }

    /// Whether the local bytes are counted by the cache usage tracker, and
    /// if so whether they are dirty.
    ///
    /// A block in `CloudToLocal` is still being staged and is not counted.
    pub fn cached(self) -> Option<bool> {
        match self {
            BlockStatus::Local | BlockStatus::LocalToCloud => Some(true),
            BlockStatus::Both => Some(false),
            _ => None,
        }
    }

    /// Whether the local copy has not yet been confirmed uploaded.
    pub fn is_dirty(self) -> bool {
        self.cached() == Some(true)
    }

    /// Whether a transfer is in flight.
    pub fn is_transient(self) -> bool {
        matches!(self, BlockStatus::LocalToCloud | BlockStatus::CloudToLocal)
    }

    /// Whether the block holds data at all.
    pub fn is_live(self) -> bool {
        !matches!(self, BlockStatus::None | BlockStatus::Deleted)
    }

    /// Whether moving from `self` to `next` is a legal ledger transition.
    ///
    /// Overwrites (any live state back to `Local`) and deletes are always
    /// allowed; everything else follows the transfer state machine.
    pub fn can_transition_to(self, next: BlockStatus) -> bool {
        use BlockStatus::{Both, Cloud, CloudToLocal, Deleted, Local, LocalToCloud, None};
        if self == next {
            return true;
        }
        match (self, next) {
            (_, Deleted) | (Deleted, None) => true,
            // Purge of a slot that never reached the backend.
            (Local, None) => true,
            (None | Cloud | Both | LocalToCloud | CloudToLocal | Deleted, Local) => true,
            (Local, LocalToCloud) => true,
            (LocalToCloud, Both) => true,
            (Both | Cloud, CloudToLocal) => true,
            (CloudToLocal, Both | Cloud) => true,
            (Both, Cloud) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BlockStatus::None => "none",
            BlockStatus::Local => "local",
            BlockStatus::Cloud => "cloud",
            BlockStatus::Both => "both",
            BlockStatus::LocalToCloud => "local_to_cloud",
            BlockStatus::CloudToLocal => "cloud_to_local",
            BlockStatus::Deleted => "deleted",
        };
        f.write_str(name)
    }
}

/// One block's entry in an inode's ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockRecord {
    /// Current status.
    pub status: BlockStatus,
    /// Status to restore if the in-flight transfer fails.
    pub prior: BlockStatus,
    /// Logical payload size in bytes.
    pub size: u64,
    /// Version of the remote object; `None` when no remote object exists.
    ///
    /// Incremented on every acknowledged upload. A `Local` record that keeps
    /// a version has a superseded remote copy which the next upload
    /// overwrites and a delete removes.
    pub object_version: Option<NonZeroU64>,
    /// Last modification time, milliseconds since the Unix epoch.
    pub modified_ms: u64,
}

impl BlockRecord {
    /// A freshly written block.
    pub fn local(size: u64, object_version: Option<NonZeroU64>, modified_ms: u64) -> Self {
        Self {
            status: BlockStatus::Local,
            prior: BlockStatus::None,
            size,
            object_version,
            modified_ms,
        }
    }

    /// Whether a remote object exists or may exist for this block.
    pub fn has_remote_object(&self) -> bool {
        self.object_version.is_some() || self.status.has_remote_copy()
    }

    /// The version the next acknowledged upload will carry.
    pub fn next_object_version(&self) -> NonZeroU64 {
        self.object_version
            .and_then(|v| v.checked_add(1))
            .unwrap_or(NonZeroU64::MIN)
    }

    /// Encode into the on-disk layout.
    ///
    /// Layout: status (1), prior (1), padding (6), size (8), object version
    /// (8, zero for none), modification time (8). Little endian.
    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut buf = [0u8; RECORD_SIZE];
        buf[0] = self.status.code();
        buf[1] = self.prior.code();
        buf[8..16].copy_from_slice(&self.size.to_le_bytes());
        let version = self.object_version.map_or(0, NonZeroU64::get);
        buf[16..24].copy_from_slice(&version.to_le_bytes());
        buf[24..32].copy_from_slice(&self.modified_ms.to_le_bytes());
        buf
    }

    /// Decode from the on-disk layout; `None` on an unknown status code.
    pub fn decode(buf: &[u8; RECORD_SIZE]) -> Option<Self> {
        let word = |range: std::ops::Range<usize>| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[range]);
            u64::from_le_bytes(bytes)
        };
        Some(Self {
            status: BlockStatus::from_code(buf[0])?,
            prior: BlockStatus::from_code(buf[1])?,
            size: word(8..16),
            object_version: NonZeroU64::new(word(16..24)),
            modified_ms: word(24..32),
        })
    }
}
