//! Rebuild command: run startup recovery and print the reconciled counters.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args as ClapArgs;
use comfy_table::{Table, presets::UTF8_FULL_CONDENSED};
use tracing::instrument;

use super::stats::accounting_table;
use crate::config::DaemonConfig;

#[derive(ClapArgs)]
pub struct Args {
    /// Directory holding the backend objects (overrides daemon.backend_dir)
    #[arg(long, value_name = "DIR")]
    pub backend_dir: Option<PathBuf>,
}

#[instrument(level = "info", name = "cmd::rebuild", skip_all)]
pub fn execute(args: &Args, config: &DaemonConfig) -> Result<()> {
    let cache = super::open_cache(config, args.backend_dir.as_deref())?;
    let report = cache.open_report();

    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(vec!["Recovery", "Count"]);
    table.add_row(vec!["Inodes scanned".to_string(), report.inodes.to_string()]);
    table.add_row(vec!["Inodes recovered".to_string(), report.recovered_inodes.to_string()]);
    table.add_row(vec!["Partial objects removed".to_string(), report.cleanup_deletes.to_string()]);
    table.add_row(vec!["Dirty inodes".to_string(), report.dirty_inodes.to_string()]);
    println!("{table}");
    println!();

    // Shutdown persists the rebuilt counters.
    cache.shutdown();
    println!("{}", accounting_table(&cache.accounting()));
    Ok(())
}
