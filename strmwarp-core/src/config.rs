//! Centralized configuration for Strmwarp.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Central configuration for all Strmwarp components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct StrmConfig {
    pub server: ServerConfig,
    pub media_server: MediaServerConfig,
    pub cache: CacheConfig,
    pub dedup: DedupConfig,
    pub batch: BatchConfig,
    pub redirect: RedirectConfig,
    pub warmup: WarmupConfig,
    pub tasks: TaskConfig,
    pub resolver: ResolverConfig,
    /// Remote storage mounts synchronized into local strm trees
    pub media_sync: Vec<MediaSyncServer>,
    /// Periodic sync jobs routed through the task manager
    pub schedules: Vec<SyncSchedule>,
}

/// Listener configuration for the proxy itself.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the reverse proxy binds to
    pub listen_addr: SocketAddr,
    /// Key required in `X-API-Key` for sync triggers (None = sync endpoint disabled)
    pub api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9096)),
            api_key: None,
        }
    }
}

/// Flavour of the upstream media server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    Emby,
    Jellyfin,
}

impl std::fmt::Display for ServerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerKind::Emby => write!(f, "emby"),
            ServerKind::Jellyfin => write!(f, "jellyfin"),
        }
    }
}

/// Upstream media server connection settings.
#[derive(Debug, Clone)]
pub struct MediaServerConfig {
    pub kind: ServerKind,
    /// Base address, e.g. `http://127.0.0.1:8096`
    pub addr: String,
    /// API key passed as `X-Emby-Token`
    pub api_key: String,
    /// Timeout for every upstream API call
    pub request_timeout: Duration,
}

impl Default for MediaServerConfig {
    fn default() -> Self {
        Self {
            kind: ServerKind::Emby,
            addr: "http://127.0.0.1:8096".to_string(),
            api_key: String::new(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// TTLs and sweep cadence for the playback cache tables.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Item info lifetime
    pub item_ttl: Duration,
    /// Strm classification lifetime
    pub strm_ttl: Duration,
    /// Rewritten PlaybackInfo lifetime
    pub playback_ttl: Duration,
    /// Interval between expired-entry sweeps
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            item_ttl: Duration::from_secs(30 * 60),     // 30 minutes
            strm_ttl: Duration::from_secs(60 * 60),     // 1 hour
            playback_ttl: Duration::from_secs(15 * 60), // 15 minutes
            sweep_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Single-flight request deduplication settings.
#[derive(Debug, Clone)]
pub struct DedupConfig {
    pub enabled: bool,
    /// Longest a waiter blocks on another caller's in-flight request
    pub max_wait: Duration,
    /// Interval of the stale in-flight entry sweep
    pub sweep_interval: Duration,
    /// In-flight table size beyond which calls bypass deduplication
    pub max_pending: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_wait: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(60),
            max_pending: 1000,
        }
    }
}

/// Batch deduplication settings.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub enabled: bool,
    /// Items per batch before an immediate flush
    pub batch_size: usize,
    /// Age of a batch's first item before a timed flush
    pub batch_timeout: Duration,
    /// Open batches beyond which items fall back to single-flight
    pub max_open_batches: usize,
    /// Longest a caller waits for its batch to resolve
    pub max_wait: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 10,
            batch_timeout: Duration::from_millis(100),
            max_open_batches: 100,
            max_wait: Duration::from_secs(5),
        }
    }
}

/// Redirect URL cache settings.
///
/// The TTL must stay below the lifetime of the signed URLs minted by
/// the remote storage backend.
#[derive(Debug, Clone)]
pub struct RedirectConfig {
    pub ttl: Duration,
    /// Drop the `scheme://` prefix when building cache keys
    pub strip_scheme_in_key: bool,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5 * 60),
            strip_scheme_in_key: true,
        }
    }
}

/// Cache warmer settings.
#[derive(Debug, Clone)]
pub struct WarmupConfig {
    pub enabled: bool,
    /// Item ids warmed at startup and on every periodic pass
    pub popular_items: Vec<String>,
    pub max_popular_items: usize,
    pub max_recent_items: usize,
    /// Interval of the periodic re-warm
    pub interval: Duration,
    /// Deadline for a single warm job
    pub timeout: Duration,
    /// Adjacent ids warmed after an access
    pub related_items_count: usize,
    /// Concurrent warm jobs
    pub max_concurrency: usize,
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            popular_items: Vec::new(),
            max_popular_items: 100,
            max_recent_items: 50,
            interval: Duration::from_secs(5 * 60),
            timeout: Duration::from_secs(30),
            related_items_count: 5,
            max_concurrency: 4,
        }
    }
}

/// Task manager settings.
#[derive(Debug, Clone)]
pub struct TaskConfig {
    /// Settle time after every task before the next is admitted
    pub cooldown: Duration,
    /// Deadline for a single task
    pub task_timeout: Duration,
    /// Most submissions waiting for the run slot; further ones fail with
    /// `TaskError::QueueFull`
    pub command_buffer: usize,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(30),
            task_timeout: Duration::from_secs(30 * 60), // 30 minutes
            command_buffer: 64,
        }
    }
}

/// External rclone invocation settings.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub rclone_binary: PathBuf,
    /// Deadline for a single download URL resolution
    pub timeout: Duration,
    /// User agent sent when the client supplied none
    pub default_user_agent: String,
    /// Options passed to `media-sync` when a source declares none
    pub default_sync_options: Vec<String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            rclone_binary: PathBuf::from("rclone"),
            timeout: Duration::from_secs(30),
            default_user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36"
                .to_string(),
            default_sync_options: vec![
                "min-size=100M".to_string(),
                "strm-format".to_string(),
                "sync-delete".to_string(),
            ],
        }
    }
}

/// A remote storage mount synchronized into a local strm tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaSyncServer {
    pub name: String,
    /// rclone remote name, without the trailing colon
    pub remote: String,
    /// Local directory the media server scans
    pub local_path: PathBuf,
}

/// A sync job resubmitted on a fixed interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSchedule {
    pub name: String,
    /// Name of the [`MediaSyncServer`] to sync
    pub server: String,
    /// Remote sub-path to sync
    pub path: String,
    pub interval: Duration,
}

impl StrmConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("STRMWARP_LISTEN_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.server.listen_addr = parsed;
            }
        }

        if let Ok(key) = std::env::var("STRMWARP_API_KEY") {
            if !key.is_empty() {
                config.server.api_key = Some(key);
            }
        }

        // Upstream media server overrides
        if let Ok(addr) = std::env::var("STRMWARP_MEDIA_SERVER_ADDR") {
            config.media_server.addr = addr;
        }

        if let Ok(key) = std::env::var("STRMWARP_MEDIA_SERVER_API_KEY") {
            config.media_server.api_key = key;
        }

        if let Ok(kind) = std::env::var("STRMWARP_MEDIA_SERVER_KIND") {
            match kind.to_ascii_lowercase().as_str() {
                "emby" => config.media_server.kind = ServerKind::Emby,
                "jellyfin" => config.media_server.kind = ServerKind::Jellyfin,
                _ => {}
            }
        }

        if let Ok(binary) = std::env::var("STRMWARP_RCLONE_BINARY") {
            config.resolver.rclone_binary = PathBuf::from(binary);
        }

        if let Ok(seconds) = std::env::var("STRMWARP_TASK_COOLDOWN_SECS") {
            if let Ok(seconds) = seconds.parse::<u64>() {
                config.tasks.cooldown = Duration::from_secs(seconds);
            }
        }

        if let Ok(millis) = std::env::var("STRMWARP_DEDUP_MAX_WAIT_MS") {
            if let Ok(millis) = millis.parse::<u64>() {
                config.dedup.max_wait = Duration::from_millis(millis);
            }
        }

        if let Ok(seconds) = std::env::var("STRMWARP_REDIRECT_TTL_SECS") {
            if let Ok(seconds) = seconds.parse::<u64>() {
                config.redirect.ttl = Duration::from_secs(seconds);
            }
        }

        if let Ok(popular) = std::env::var("STRMWARP_WARMUP_POPULAR") {
            config.warmup.popular_items = popular
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .collect();
        }

        // Entries formatted as `name|remote|/local/path`, separated by `;`
        if let Ok(servers) = std::env::var("STRMWARP_MEDIA_SYNC") {
            config.media_sync = servers
                .split(';')
                .filter_map(|entry| {
                    let mut parts = entry.trim().splitn(3, '|');
                    let name = parts.next()?.trim();
                    let remote = parts.next()?.trim();
                    let local_path = parts.next()?.trim();
                    if name.is_empty() || remote.is_empty() || local_path.is_empty() {
                        return None;
                    }
                    Some(MediaSyncServer {
                        name: name.to_string(),
                        remote: remote.trim_end_matches(':').to_string(),
                        local_path: PathBuf::from(local_path),
                    })
                })
                .collect();
        }

        config
    }

    /// Creates a configuration optimized for testing.
    pub fn for_testing() -> Self {
        Self {
            cache: CacheConfig {
                sweep_interval: Duration::from_millis(50),
                ..Default::default()
            },
            dedup: DedupConfig {
                max_wait: Duration::from_millis(500),
                sweep_interval: Duration::from_millis(100),
                ..Default::default()
            },
            batch: BatchConfig {
                batch_timeout: Duration::from_millis(50),
                max_wait: Duration::from_millis(500),
                ..Default::default()
            },
            warmup: WarmupConfig {
                interval: Duration::from_secs(3600), // Periodic pass effectively off
                timeout: Duration::from_millis(500),
                related_items_count: 2,
                ..Default::default()
            },
            tasks: TaskConfig {
                cooldown: Duration::from_millis(50),
                task_timeout: Duration::from_secs(2),
                ..Default::default()
            },
            resolver: ResolverConfig {
                timeout: Duration::from_millis(500),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Local mount paths whose strm files are served as plain HTTP strm.
    pub fn local_sync_prefixes(&self) -> Vec<PathBuf> {
        self.media_sync
            .iter()
            .map(|server| server.local_path.clone())
            .filter(|path| !path.as_os_str().is_empty())
            .collect()
    }

    /// Finds a media sync server by name, falling back to the first one.
    pub fn media_sync_server(&self, name: Option<&str>) -> Option<&MediaSyncServer> {
        match name.filter(|n| !n.is_empty()) {
            Some(name) => self.media_sync.iter().find(|server| server.name == name),
            None => self.media_sync.first(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = StrmConfig::default();

        assert_eq!(config.cache.item_ttl, Duration::from_secs(1800));
        assert_eq!(config.cache.strm_ttl, Duration::from_secs(3600));
        assert_eq!(config.dedup.max_wait, Duration::from_secs(5));
        assert_eq!(config.dedup.max_pending, 1000);
        assert_eq!(config.batch.batch_size, 10);
        assert_eq!(config.batch.batch_timeout, Duration::from_millis(100));
        assert_eq!(config.tasks.cooldown, Duration::from_secs(30));
        assert_eq!(config.warmup.max_recent_items, 50);
        assert!(config.redirect.strip_scheme_in_key);
        assert!(config.server.api_key.is_none());
    }

    #[test]
    fn test_testing_preset_is_fast() {
        let config = StrmConfig::for_testing();
        assert!(config.tasks.cooldown < Duration::from_secs(1));
        assert!(config.dedup.max_wait < Duration::from_secs(1));
        assert!(config.cache.sweep_interval < Duration::from_secs(1));
    }

    #[test]
    fn test_media_sync_lookup() {
        let config = StrmConfig {
            media_sync: vec![
                MediaSyncServer {
                    name: "main".to_string(),
                    remote: "115".to_string(),
                    local_path: PathBuf::from("/mnt/strm/115"),
                },
                MediaSyncServer {
                    name: "backup".to_string(),
                    remote: "od".to_string(),
                    local_path: PathBuf::new(),
                },
            ],
            ..Default::default()
        };

        assert_eq!(config.media_sync_server(None).unwrap().name, "main");
        assert_eq!(config.media_sync_server(Some("")).unwrap().name, "main");
        assert_eq!(config.media_sync_server(Some("backup")).unwrap().remote, "od");
        assert!(config.media_sync_server(Some("missing")).is_none());
        assert_eq!(
            config.local_sync_prefixes(),
            vec![PathBuf::from("/mnt/strm/115")]
        );
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("STRMWARP_MEDIA_SERVER_KIND", "jellyfin");
            std::env::set_var("STRMWARP_TASK_COOLDOWN_SECS", "5");
            std::env::set_var("STRMWARP_WARMUP_POPULAR", "10, 11,,12");
            std::env::set_var("STRMWARP_MEDIA_SYNC", "main|115:|/mnt/115;broken|x");
        }

        let config = StrmConfig::from_env();

        assert_eq!(config.media_server.kind, ServerKind::Jellyfin);
        assert_eq!(config.tasks.cooldown, Duration::from_secs(5));
        assert_eq!(config.warmup.popular_items, vec!["10", "11", "12"]);
        assert_eq!(config.media_sync.len(), 1);
        assert_eq!(config.media_sync[0].remote, "115");
        assert_eq!(config.media_sync[0].local_path, PathBuf::from("/mnt/115"));

        // Cleanup
        unsafe {
            std::env::remove_var("STRMWARP_MEDIA_SERVER_KIND");
            std::env::remove_var("STRMWARP_TASK_COOLDOWN_SECS");
            std::env::remove_var("STRMWARP_WARMUP_POPULAR");
            std::env::remove_var("STRMWARP_MEDIA_SYNC");
        }
    }
}
