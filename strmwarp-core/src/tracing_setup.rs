//! Tracing setup for Strmwarp
//!
//! The console shows strmwarp's own events at the chosen level. The last
//! run's log file keeps strmwarp at trace, where redirect decisions, dedup
//! joins and task transitions are recorded.

use std::fs::{File, create_dir_all};
use std::path::{Path, PathBuf};

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Targets emitted by this workspace.
const STRMWARP_TARGETS: [&str; 3] = ["strmwarp", "strmwarp_core", "strmwarp_web"];

/// Log file name inside the logs directory, replaced on every run.
pub const LOG_FILE_NAME: &str = "strmwarp-last-run.log";

/// Filter directives: strmwarp at `own`, request traces from
/// `tower_http` at `requests`, everything else at `dependencies`.
fn directives(own: Level, requests: Level, dependencies: Level) -> String {
    let mut directives = vec![dependencies.to_string().to_lowercase()];
    directives.extend(
        STRMWARP_TARGETS
            .iter()
            .map(|target| format!("{target}={}", own.to_string().to_lowercase())),
    );
    directives.push(format!("tower_http={}", requests.to_string().to_lowercase()));
    directives.join(",")
}

/// Console directives for `level`. Per-request traces only appear from
/// debug upwards.
pub fn console_directives(level: Level) -> String {
    let requests = if level >= Level::DEBUG { Level::DEBUG } else { Level::WARN };
    directives(level, requests, Level::WARN)
}

/// File directives, independent of the console level.
pub fn file_directives() -> String {
    directives(Level::TRACE, Level::DEBUG, Level::INFO)
}

/// Initialize tracing with console output at `console_level` and a trace
/// log at `logs_dir/strmwarp-last-run.log` (default `./logs`).
///
/// `RUST_LOG` overrides the console filter when set.
///
/// # Errors
///
/// - `std::io::Error` - The logs directory or log file could not be created
pub fn init_tracing(console_level: Level, logs_dir: Option<&Path>) -> std::io::Result<PathBuf> {
    let logs_path = logs_dir.unwrap_or_else(|| Path::new("logs"));
    create_dir_all(logs_path)?;
    let log_file_path = logs_path.join(LOG_FILE_NAME);
    let log_file = File::create(&log_file_path)?;

    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(console_directives(console_level)));
    let console_layer = fmt::layer().with_target(true).with_filter(console_filter);

    let file_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(log_file)
        .with_filter(EnvFilter::new(file_directives()));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .init();

    tracing::info!(
        "Tracing initialized: console={console_level}, file={}",
        log_file_path.display()
    );
    Ok(log_file_path)
}

/// CLI log levels for user control
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum CliLogLevel {
    Error,
    Warn,
    #[default]
    Info,
    /// Also shows each proxied request
    Debug,
    Trace,
}

impl From<CliLogLevel> for Level {
    fn from(level: CliLogLevel) -> Self {
        match level {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}
