//! Configuration for the block cache engine.
//!
//! All sections deserialize with defaults, so a partial TOML file only needs
//! to name the values it changes. Durations are written in humantime form
//! (`"250ms"`, `"30s"`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Default maximum block size (1 MiB).
pub const DEFAULT_BLOCK_SIZE: usize = 1024 * 1024;

/// Default number of hashed sub-directories for meta and block files.
pub const DEFAULT_SUBDIRS: u64 = 1000;

/// Default soft cache limit (8 GiB).
pub const DEFAULT_SOFT_LIMIT: u64 = 8 * 1024 * 1024 * 1024;

/// Default hard cache limit (10 GiB).
pub const DEFAULT_HARD_LIMIT: u64 = 10 * 1024 * 1024 * 1024;

/// Invalid configuration values.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A pool size or count was zero.
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    /// The soft limit is not below the hard limit.
    #[error("soft limit ({soft}) must be lower than hard limit ({hard})")]
    LimitOrder {
        /// Configured soft limit.
        soft: u64,
        /// Configured hard limit.
        hard: u64,
    },
}

/// On-disk locations used by the core.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root of the per-inode meta files.
    pub meta_dir: PathBuf,
    /// Root of the block data files.
    pub block_dir: PathBuf,
    /// File holding the persisted system accounting counters.
    pub system_data: PathBuf,
    /// Number of hashed sub-directories under each root.
    pub subdirs: u64,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self::under(Path::new("/var/lib/hcfs"))
    }
}

impl PathsConfig {
    /// Lay out every path below a single root directory.
    pub fn under(root: &Path) -> Self {
        Self {
            meta_dir: root.join("metastorage"),
            block_dir: root.join("blockstorage"),
            system_data: root.join("system_data.json"),
            subdirs: DEFAULT_SUBDIRS,
        }
    }
}

/// Cache budget and reclaim behaviour.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum payload size of a single block.
    pub block_size: usize,
    /// Cache size (bytes) above which the reclaimer starts evicting.
    pub soft_limit: u64,
    /// Cache size (bytes) above which new writes wait or are rejected.
    pub hard_limit: u64,
    /// How long a writer waits for space at the hard limit before ENOSPC.
    #[serde(with = "humantime_serde")]
    pub hard_limit_wait: Duration,
    /// Maximum sleep between reclaimer checks when nobody signals pressure.
    #[serde(with = "humantime_serde")]
    pub reclaim_interval: Duration,
    /// Whether block and ledger writes are fsynced.
    pub fsync: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            soft_limit: DEFAULT_SOFT_LIMIT,
            hard_limit: DEFAULT_HARD_LIMIT,
            hard_limit_wait: Duration::from_secs(30),
            reclaim_interval: Duration::from_secs(1),
            fsync: true,
        }
    }
}

/// Concurrency bounds for the transfer worker pools.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Concurrent block uploads (and upload connections).
    pub upload_concurrency: usize,
    /// Concurrent downloads (and download connections).
    pub download_concurrency: usize,
    /// Concurrent remote deletes (and delete connections).
    pub delete_concurrency: usize,
    /// Number of per-inode sync workers.
    pub sync_concurrency: usize,
    /// Capacity of each worker pool's submission queue.
    pub queue_capacity: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            upload_concurrency: 8,
            download_concurrency: 8,
            delete_concurrency: 4,
            sync_concurrency: 4,
            queue_capacity: 1024,
        }
    }
}

/// Retry budget for one block operation.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Upper bound for a single delay.
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Randomize delays to avoid synchronized retries.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            jitter: true,
        }
    }
}

/// Background sync of dirty inodes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How often dirty inodes are dispatched to the sync workers.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Upload a snapshot of the meta file after each block sync pass.
    pub upload_meta: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            upload_meta: true,
        }
    }
}

/// Persistence cadence of the system accounting file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AccountingConfig {
    /// How often the counters are written to disk.
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
}

impl Default for AccountingConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(5),
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HcfsConfig {
    /// On-disk locations.
    pub paths: PathsConfig,
    /// Cache budget.
    pub cache: CacheConfig,
    /// Worker pool sizes.
    pub transfer: TransferConfig,
    /// Retry budget.
    pub retry: RetryConfig,
    /// Dirty inode sync.
    pub sync: SyncConfig,
    /// Accounting persistence.
    pub accounting: AccountingConfig,
}

impl HcfsConfig {
    /// Default configuration with every path placed under `root`.
    pub fn for_root(root: &Path) -> Self {
        Self {
            paths: PathsConfig::under(root),
            ..Default::default()
        }
    }

    /// Sets the soft and hard cache limits.
    #[must_use]
    pub fn cache_limits(mut self, soft: u64, hard: u64) -> Self {
        self.cache.soft_limit = soft;
        self.cache.hard_limit = hard;
        self
    }

    /// Sets the maximum block size.
    #[must_use]
    pub fn block_size(mut self, size: usize) -> Self {
        self.cache.block_size = size;
        self
    }

    /// Sets how long writers wait for space at the hard limit.
    #[must_use]
    pub fn hard_limit_wait(mut self, wait: Duration) -> Self {
        self.cache.hard_limit_wait = wait;
        self
    }

    /// Sets the interval between background sync dispatches.
    #[must_use]
    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.sync.interval = interval;
        self
    }

    /// Sets the retry budget.
    #[must_use]
    pub fn retry(mut self, max_attempts: u32, initial_backoff: Duration) -> Self {
        self.retry.max_attempts = max_attempts;
        self.retry.initial_backoff = initial_backoff;
        self.retry.max_backoff = self.retry.max_backoff.max(initial_backoff);
        self
    }

    /// Sets the upload, download and delete concurrency in one go.
    #[must_use]
    pub fn transfer_concurrency(mut self, n: usize) -> Self {
        self.transfer.upload_concurrency = n;
        self.transfer.download_concurrency = n;
        self.transfer.delete_concurrency = n;
        self
    }

    /// Check the configuration for values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.block_size == 0 {
            return Err(ConfigError::Zero("cache.block_size"));
        }
        if self.paths.subdirs == 0 {
            return Err(ConfigError::Zero("paths.subdirs"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Zero("retry.max_attempts"));
        }
        let pools = [
            ("transfer.upload_concurrency", self.transfer.upload_concurrency),
            ("transfer.download_concurrency", self.transfer.download_concurrency),
            ("transfer.delete_concurrency", self.transfer.delete_concurrency),
            ("transfer.sync_concurrency", self.transfer.sync_concurrency),
            ("transfer.queue_capacity", self.transfer.queue_capacity),
        ];
        if let Some(&(name, _)) = pools.iter().find(|(_, n)| *n == 0) {
            return Err(ConfigError::Zero(name));
        }
        if self.cache.soft_limit >= self.cache.hard_limit {
            return Err(ConfigError::LimitOrder {
                soft: self.cache.soft_limit,
                hard: self.cache.hard_limit,
            });
        }
        Ok(())
    }
}
