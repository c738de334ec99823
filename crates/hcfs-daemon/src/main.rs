#![deny(unsafe_code)]

mod commands;
mod config;

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::commands::{rebuild, run, stats};
use crate::config::DaemonConfig;

/// HCFS block cache daemon
#[derive(Parser)]
#[command(name = "hcfsd", version, about, long_about = None)]
#[command(after_help = "\
Examples:
    hcfsd run --backend-dir /srv/hcfs-objects
    hcfsd -v --config ./hcfsd.toml rebuild
    hcfsd stats
")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file (default: platform config dir, hcfs/hcfsd.toml)
    #[arg(short, long, value_name = "PATH", env = "HCFSD_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Place every cache path under this directory
    #[arg(long, value_name = "DIR", global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the cache engine until interrupted
    Run(run::Args),

    /// Run startup recovery and print the rebuilt counters
    Rebuild(rebuild::Args),

    /// Show the persisted system accounting
    Stats(stats::Args),
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    setup_tracing(cli.verbose);

    let mut config = DaemonConfig::load(cli.config.as_deref())?;
    if let Some(root) = &cli.root {
        config.relocate(root);
    }

    match cli.command {
        Commands::Run(args) => run::execute(&args, &config),
        Commands::Rebuild(args) => rebuild::execute(&args, &config),
        Commands::Stats(args) => stats::execute(&args, &config),
    }
}

fn setup_tracing(verbose: u8) {
    let filter = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_writer(io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parses_run_with_backend_dir() {
        let cli = Cli::try_parse_from(["hcfsd", "-vv", "run", "--backend-dir", "/srv/o"]).unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Run(args) => assert_eq!(args.backend_dir, Some(PathBuf::from("/srv/o"))),
            _ => panic!("expected run"),
        }
    }
}
