//! Configuration file support for hcfsd.
//!
//! The file is TOML. Every engine section of [`HcfsConfig`] sits at the top
//! level and a `[daemon]` table holds the settings only the binary uses.
//! A missing file means defaults throughout.
//!
//! # Example configuration
//!
//! ```toml
//! [daemon]
//! backend_dir = "/srv/hcfs-objects"
//!
//! [paths]
//! meta_dir = "/var/lib/hcfs/metastorage"
//! block_dir = "/var/lib/hcfs/blockstorage"
//! system_data = "/var/lib/hcfs/system_data.json"
//!
//! [cache]
//! soft_limit = 8589934592
//! hard_limit = 10737418240
//! hard_limit_wait = "30s"
//!
//! [sync]
//! interval = "1s"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use hcfs_core::HcfsConfig;
use hcfs_core::config::PathsConfig;
use serde::Deserialize;

/// Whole configuration file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Binary-only settings
    pub daemon: DaemonSection,

    /// Engine settings
    #[serde(flatten)]
    pub core: HcfsConfig,
}

/// `[daemon]` table
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DaemonSection {
    /// Directory of the directory-backed object store
    pub backend_dir: Option<PathBuf>,
}

impl DaemonConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("Failed to parse configuration")
    }

    /// Load from `path`, or from [`config_path`] when none is given.
    ///
    /// An explicitly named file must exist; the default one may be absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (config_path()?, false),
        };

        if !path.exists() {
            if explicit {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        let text = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config = Self::from_toml(&text)
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        tracing::info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Move every cache path under `root`, keeping the sub-directory count.
    pub fn relocate(&mut self, root: &Path) {
        let subdirs = self.core.paths.subdirs;
        self.core.paths = PathsConfig {
            subdirs,
            ..PathsConfig::under(root)
        };
    }

    /// Backend directory from the command line, falling back to the file.
    pub fn backend_dir(&self, cli: Option<&Path>) -> Result<PathBuf> {
        cli.map(Path::to_path_buf)
            .or_else(|| self.daemon.backend_dir.clone())
            .context("No backend directory: pass --backend-dir or set daemon.backend_dir")
    }
}

/// Default configuration file location.
///
/// `~/.config/hcfs/hcfsd.toml` on Linux, the platform equivalent elsewhere.
pub fn config_path() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("org", "hcfs", "hcfs")
        .context("Could not determine configuration directory")?;
    Ok(dirs.config_dir().join("hcfsd.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = DaemonConfig::from_toml("").unwrap();
        assert!(config.daemon.backend_dir.is_none());
        assert_eq!(config.core.cache.block_size, hcfs_core::config::DEFAULT_BLOCK_SIZE);
        config.core.validate().unwrap();
    }

    #[test]
    fn test_sections_parse_next_to_daemon_table() {
        let config = DaemonConfig::from_toml(
            r#"
            [daemon]
            backend_dir = "/srv/objects"

            [cache]
            soft_limit = 1000
            hard_limit = 2000
            hard_limit_wait = "250ms"

            [sync]
            interval = "2s"
            "#,
        )
        .unwrap();
        assert_eq!(config.daemon.backend_dir.as_deref(), Some(Path::new("/srv/objects")));
        assert_eq!(config.core.cache.soft_limit, 1000);
        assert_eq!(config.core.cache.hard_limit, 2000);
        assert_eq!(config.core.cache.hard_limit_wait, Duration::from_millis(250));
        assert_eq!(config.core.sync.interval, Duration::from_secs(2));
    }

    #[test]
    fn test_relocate_keeps_subdirs() {
        let mut config = DaemonConfig::from_toml("[paths]\nsubdirs = 7\n").unwrap();
        config.relocate(Path::new("/tmp/hcfs-root"));
        assert_eq!(config.core.paths.subdirs, 7);
        assert_eq!(config.core.paths.meta_dir, Path::new("/tmp/hcfs-root/metastorage"));
    }

    #[test]
    fn test_backend_dir_prefers_command_line() {
        let config = DaemonConfig::from_toml("[daemon]\nbackend_dir = \"/a\"\n").unwrap();
        assert_eq!(config.backend_dir(Some(Path::new("/b"))).unwrap(), Path::new("/b"));
        assert_eq!(config.backend_dir(None).unwrap(), Path::new("/a"));
        assert!(DaemonConfig::default().backend_dir(None).is_err());
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert!(DaemonConfig::load(Some(&tmp.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn test_load_reads_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("hcfsd.toml");
        fs::write(&path, "[transfer]\nupload_concurrency = 3\n").unwrap();
        let config = DaemonConfig::load(Some(&path)).unwrap();
        assert_eq!(config.core.transfer.upload_concurrency, 3);
    }
}
