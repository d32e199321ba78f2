//! Strmwarp Core - caching, deduplication and strm resolution
//!
//! This crate provides the building blocks of a reverse proxy in front of
//! an Emby or Jellyfin server: TTL caches for item and playback data,
//! single-flight and batch request deduplication, cache warming, a
//! serialized task manager for sync jobs, and the redirect engine that
//! turns strm media sources into direct download URLs.

pub mod cache;
pub mod config;
pub mod dedup;
pub mod remote;
pub mod server_components;
pub mod strm;
pub mod tasks;
pub mod tracing_setup;
pub mod upstream;
pub mod warmer;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_mocks;

// Re-export main types for convenient access
pub use cache::{KeyedTtlCache, PlaybackCache};
pub use config::StrmConfig;
pub use dedup::{BatchDeduplicator, DedupError, RequestDeduplicator};
pub use remote::{RemoteLinkResolver, ResolveError};
pub use server_components::{ServerComponents, ServiceStats};
pub use strm::{Resolution, ResolutionEngine, StrmClassification};
pub use tasks::{SyncError, SyncService, TaskError, TaskManager};
pub use upstream::{MediaServerClient, UpstreamError};
pub use warmer::CacheWarmer;

/// Errors that can bubble up from any Strmwarp subsystem.
#[derive(Debug, thiserror::Error)]
pub enum StrmError {
    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("Resolve error: {0}")]
    Resolve(#[from] ResolveError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StrmError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            StrmError::Upstream(e) => match e {
                UpstreamError::ItemNotFound { id } => format!("Item {id} not found"),
                UpstreamError::Status { status, .. } => {
                    format!("Media server responded with status {status}")
                }
                _ => "Could not reach the media server".to_string(),
            },
            StrmError::Resolve(_) => "Could not resolve a download link".to_string(),
            StrmError::Sync(e) => match e {
                SyncError::InvalidRequest { reason } => format!("Invalid sync request: {reason}"),
                SyncError::UnknownServer { name } => format!("Unknown sync server: {name}"),
                SyncError::NoServersConfigured => "No sync servers configured".to_string(),
                _ => "Sync failed".to_string(),
            },
            StrmError::Task(TaskError::QueueFull { .. }) => {
                "Too many tasks queued, try again later".to_string()
            }
            StrmError::Task(TaskError::Shutdown) => "Server is shutting down".to_string(),
            StrmError::Configuration { .. } => "Configuration error occurred".to_string(),
            StrmError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            StrmError::Configuration { .. }
                | StrmError::Sync(
                    SyncError::InvalidRequest { .. }
                        | SyncError::UnknownServer { .. }
                        | SyncError::NoServersConfigured
                )
        )
    }
}

pub type Result<T> = std::result::Result<T, StrmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_errors() {
        let err = StrmError::from(SyncError::UnknownServer {
            name: "gd".to_string(),
        });
        assert!(err.is_user_error());
        assert_eq!(err.user_message(), "Unknown sync server: gd");

        let err = StrmError::from(UpstreamError::Request {
            reason: "refused".to_string(),
        });
        assert!(!err.is_user_error());
        assert_eq!(err.user_message(), "Could not reach the media server");
    }
}
