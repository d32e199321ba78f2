//! Strmwarp CLI - Command-line interface
//!
//! Runs the reverse proxy and provides one-off sync and classification
//! commands.

mod commands;

use anyhow::Context;
use clap::Parser;
use strmwarp_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "strmwarp")]
#[command(about = "Strm redirect proxy for Emby and Jellyfin")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: commands::Commands,

    /// Console log level (RUST_LOG takes precedence)
    #[arg(long, value_enum, default_value_t = CliLogLevel::Info)]
    log_level: CliLogLevel,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.into(), None).context("Failed to initialize logging")?;

    commands::handle_command(cli.command).await
}
