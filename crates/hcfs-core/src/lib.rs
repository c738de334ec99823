//! Block lifecycle, transfer and cache-reclaim engine for HCFS.
//!
//! HCFS keeps file data as fixed-maximum-size blocks in a local cache and
//! mirrors them to an object-storage backend. This crate owns everything
//! between the FUSE operation layer and that backend.
//!
//! # Components
//!
//! ## Ledger and state machine
//!
//! - [`BlockStatus`] - Where a block's bytes live (`Local`, `Cloud`, `Both`, ...)
//! - [`BlockRecord`] - Fixed-size per-block entry in an inode's meta file
//! - [`ledger::Ledger`] - Per-inode meta files behind per-inode locks, with
//!   crash recovery ([`ledger::Ledger::normalize`])
//!
//! ## Cache accounting
//!
//! - [`tracker::CacheUsageTracker`] - Per-inode clean/dirty byte counts in
//!   hashed buckets, feeding the eviction order
//! - [`accounting::Accounting`] - Process-wide counters persisted to the
//!   system-data file
//! - [`reclaimer::CacheReclaimer`] - Soft/hard limit enforcement
//!
//! ## Transfers
//!
//! - [`backend::ObjectBackend`] - Object store collaborator
//! - [`pool::TransferPool`] - Bounded connection pool with RAII guards
//! - [`transfer::TransferEngine`] - Upload, download and delete with retry
//! - [`sync::SyncScheduler`] - Per-inode sync passes on a fixed worker pool
//!
//! [`BlockCache`] wires all of it together and is what the filesystem layer
//! talks to.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use hcfs_core::{BlockCache, HcfsConfig};
//! use hcfs_core::backend::MemoryBackend;
//!
//! let config = HcfsConfig::for_root(std::path::Path::new("/tmp/hcfs"));
//! let cache = BlockCache::open(config, Arc::new(MemoryBackend::new()))?;
//!
//! cache.write_block(7, 0, b"hello")?;
//! cache.sync_inode(7)?;
//! assert_eq!(&cache.read_block(7, 0)?[..], b"hello");
//! cache.shutdown();
//! # Ok::<(), hcfs_core::BlockError>(())
//! ```

pub mod accounting;
pub mod backend;
pub mod block_store;
pub mod cache;
pub mod config;
pub mod error;
pub mod layout;
pub mod ledger;
pub mod pool;
pub mod reclaimer;
pub mod retry;
pub mod status;
pub mod sync;
pub mod tracker;
pub mod transfer;
pub mod worker;

use std::time::{SystemTime, UNIX_EPOCH};

pub use cache::BlockCache;
pub use config::{ConfigError, HcfsConfig};
pub use error::{BlockError, BlockResult, RetryClass};
pub use status::{BlockRecord, BlockStatus};

/// Inode number as assigned by the filesystem layer.
pub type InodeId = u64;

/// Index of a block within its file.
pub type BlockIndex = u64;

/// Milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
