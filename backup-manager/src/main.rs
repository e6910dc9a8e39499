//! Backup Manager - Main entry point
//!
//! Manages rclone folder backups from the command line and, in daemon mode,
//! re-runs them on a fixed interval.

mod commands;

use anyhow::Result;
use backup_manager::{utils, RuntimeConfig};
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the backup set configuration (default: folders.json next to the executable)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: commands::Command,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let runtime = RuntimeConfig::from_env(args.config);

    let log_level = args.log_level.as_deref().unwrap_or(&runtime.log_level);
    utils::logger::init(log_level)?;

    tracing::debug!(
        "Starting backup-manager v{} (config: {})",
        env!("CARGO_PKG_VERSION"),
        runtime.config_path.display()
    );

    commands::execute(args.command, &runtime).await
}
