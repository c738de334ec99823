pub mod rebuild;
pub mod run;
pub mod stats;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use hcfs_core::BlockCache;
use hcfs_core::backend::DirectoryBackend;

use crate::config::DaemonConfig;

/// Open the block cache over a directory-backed object store.
///
/// Opening runs ledger recovery and the usage rebuild before any background
/// thread starts.
pub fn open_cache(config: &DaemonConfig, backend_dir: Option<&Path>) -> Result<Arc<BlockCache>> {
    let backend_dir = config.backend_dir(backend_dir)?;
    let backend = DirectoryBackend::open(&backend_dir)
        .with_context(|| format!("Failed to open backend directory: {}", backend_dir.display()))?;
    tracing::info!(backend = %backend_dir.display(), "opening block cache");
    BlockCache::open(config.core.clone(), Arc::new(backend)).context("Failed to open block cache")
}
