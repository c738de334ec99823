//! Run command: serve the cache until interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args as ClapArgs;
use tracing::instrument;

use crate::config::DaemonConfig;

#[derive(ClapArgs)]
pub struct Args {
    /// Directory holding the backend objects (overrides daemon.backend_dir)
    #[arg(long, value_name = "DIR")]
    pub backend_dir: Option<PathBuf>,
}

#[instrument(level = "info", name = "cmd::run", skip_all)]
pub fn execute(args: &Args, config: &DaemonConfig) -> Result<()> {
    let cache = super::open_cache(config, args.backend_dir.as_deref())?;
    let report = cache.open_report();
    eprintln!(
        "hcfsd running: {} inodes, {} recovered, {} queued for sync",
        report.inodes, report.recovered_inodes, report.dirty_inodes
    );
    eprintln!("Press Ctrl+C to stop");

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nReceived interrupt signal, draining...");
        r.store(false, Ordering::SeqCst);
    })
    .context("Failed to set signal handler")?;

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }

    cache.shutdown();
    let acct = cache.accounting();
    let transfers = cache.engine().stats();
    tracing::info!(
        cache_size = acct.cache_size,
        dirty = acct.dirty_cache_size,
        uploads = transfers.uploads.load(Ordering::Relaxed),
        downloads = transfers.downloads.load(Ordering::Relaxed),
        deletes = transfers.deletes.load(Ordering::Relaxed),
        "hcfsd stopped"
    );
    eprintln!("Stopped.");
    Ok(())
}
