//! Stats command for displaying the persisted system accounting.

use anyhow::{Context, Result};
use clap::Args as ClapArgs;
use comfy_table::{Table, presets::UTF8_FULL_CONDENSED};
use hcfs_core::accounting::{Accounting, SystemAccounting};
use tracing::instrument;

use crate::config::DaemonConfig;

#[derive(ClapArgs)]
pub struct Args {
    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Default, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    /// One `key=value` line per counter
    Plain,
}

#[instrument(level = "info", name = "cmd::stats", skip_all)]
pub fn execute(args: &Args, config: &DaemonConfig) -> Result<()> {
    let path = &config.core.paths.system_data;
    if !path.exists() {
        anyhow::bail!("No system data at {} (has hcfsd run?)", path.display());
    }
    let stats = Accounting::load(path, false)
        .with_context(|| format!("Failed to read system data: {}", path.display()))?
        .snapshot();

    match args.format {
        OutputFormat::Table => {
            println!("{}", accounting_table(&stats));
            println!("  Limits: soft {}, hard {}",
                format_bytes(config.core.cache.soft_limit),
                format_bytes(config.core.cache.hard_limit));
        }
        OutputFormat::Plain => {
            for (key, value) in counters(&stats) {
                println!("{key}={value}");
            }
        }
    }
    Ok(())
}

fn counters(stats: &SystemAccounting) -> [(&'static str, u64); 7] {
    [
        ("cache_size", stats.cache_size),
        ("cache_blocks", stats.cache_blocks),
        ("dirty_cache_size", stats.dirty_cache_size),
        ("clean_cache_size", stats.clean_cache_size()),
        ("total_inodes", stats.total_inodes),
        ("backend_size", stats.backend_size),
        ("backend_objects", stats.backend_objects),
    ]
}

pub fn accounting_table(stats: &SystemAccounting) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(vec!["Metric", "Local", "Backend"]);
    table.add_row(vec![
        "Bytes".to_string(),
        format_bytes(stats.cache_size),
        format_bytes(stats.backend_size),
    ]);
    table.add_row(vec![
        "Blocks".to_string(),
        stats.cache_blocks.to_string(),
        stats.backend_objects.to_string(),
    ]);
    table.add_row(vec![
        "Dirty".to_string(),
        format_bytes(stats.dirty_cache_size),
        String::new(),
    ]);
    table.add_row(vec![
        "Clean".to_string(),
        format_bytes(stats.clean_cache_size()),
        String::new(),
    ]);
    table.add_row(vec![
        "Inodes".to_string(),
        stats.total_inodes.to_string(),
        String::new(),
    ]);
    table
}

/// Format bytes as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(10 * 1024 * 1024 * 1024), "10.00 GB");
    }

    #[test]
    fn test_counters_include_clean_size() {
        let stats = SystemAccounting {
            cache_size: 100,
            dirty_cache_size: 30,
            ..SystemAccounting::default()
        };
        let counters = counters(&stats);
        assert!(counters.contains(&("clean_cache_size", 70)));
    }
}
