//! Runtime services shared by the web layer and the CLI.
//!
//! Production wiring uses the HTTP media server client and rclone; tests
//! pass mock collaborators to [`ServerComponents::build`].

use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;

use crate::cache::{PlaybackCache, PlaybackCacheStats};
use crate::config::StrmConfig;
use crate::dedup::{BatchStats, DedupStats};
use crate::remote::{RcloneLinkResolver, RemoteLinkResolver};
use crate::strm::{MediaLookup, ResolutionEngine, StrmClassifier};
use crate::tasks::{MediaSyncBackend, RcloneSyncBackend, SyncService, TaskManager, TaskStatus};
use crate::upstream::{HttpMediaServerClient, MediaServerClient, UpstreamError};
use crate::warmer::{CacheWarmer, WarmerStats, WarmupReport};

/// Point-in-time counters across all services.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub cache: PlaybackCacheStats,
    pub item_dedup: DedupStats,
    pub link_dedup: DedupStats,
    pub batch: BatchStats,
    pub warmer: WarmerStats,
    pub tasks: TaskStatus,
}

/// Pre-configured runtime services.
///
/// One instance exists per process; it owns the only [`TaskManager`].
pub struct ServerComponents {
    pub config: Arc<StrmConfig>,
    pub upstream: Arc<dyn MediaServerClient>,
    pub cache: Arc<PlaybackCache>,
    pub lookup: Arc<MediaLookup>,
    pub engine: Arc<ResolutionEngine>,
    pub warmer: Arc<CacheWarmer>,
    pub tasks: TaskManager,
    pub sync: Arc<SyncService>,
}

impl ServerComponents {
    /// Wires services around the given collaborators.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn build(
        config: StrmConfig,
        upstream: Arc<dyn MediaServerClient>,
        resolver: Arc<dyn RemoteLinkResolver>,
        sync_backend: Arc<dyn MediaSyncBackend>,
    ) -> Self {
        let cache = Arc::new(PlaybackCache::new(
            config.cache.clone(),
            config.redirect.clone(),
        ));
        let lookup = Arc::new(MediaLookup::new(
            Arc::clone(&cache),
            Arc::clone(&upstream),
            StrmClassifier::new(config.local_sync_prefixes()),
            config.dedup.clone(),
        ));
        let warmer = Arc::new(CacheWarmer::new(
            Arc::clone(&lookup),
            config.warmup.clone(),
        ));
        let engine = Arc::new(
            ResolutionEngine::new(
                Arc::clone(&lookup),
                resolver,
                config.dedup.clone(),
                config.batch.clone(),
                config.resolver.clone(),
                config.redirect.clone(),
            )
            .with_warmer(Arc::clone(&warmer)),
        );

        let tasks = TaskManager::spawn(config.tasks.clone());
        let sync = Arc::new(SyncService::new(
            config.media_sync.clone(),
            config.resolver.default_sync_options.clone(),
            tasks.clone(),
            sync_backend,
            Arc::clone(&upstream),
        ));

        Self {
            config: Arc::new(config),
            upstream,
            cache,
            lookup,
            engine,
            warmer,
            tasks,
            sync,
        }
    }

    /// Wires services against the configured media server and rclone.
    ///
    /// # Errors
    ///
    /// - `UpstreamError::Request` - The media server address is invalid
    pub fn from_config(config: StrmConfig) -> Result<Self, UpstreamError> {
        let upstream = Arc::new(HttpMediaServerClient::new(&config.media_server)?);
        let resolver = Arc::new(RcloneLinkResolver::new(&config.resolver));
        let sync_backend = Arc::new(RcloneSyncBackend::new(&config.resolver, &config.tasks));
        Ok(Self::build(config, upstream, resolver, sync_backend))
    }

    /// Starts the warm-up pass, the periodic re-warm and sync schedules.
    ///
    /// Returns the handle of the startup warm-up, which never blocks startup.
    pub fn start_background(&self) -> JoinHandle<WarmupReport> {
        let warmup = self.warmer.startup_warmup();
        if self.warmer.is_enabled() {
            self.warmer.start_periodic();
        }
        self.sync.start_schedules(&self.config.schedules);
        warmup
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            cache: self.cache.stats(),
            item_dedup: self.lookup.item_dedup_stats(),
            link_dedup: self.engine.link_dedup_stats(),
            batch: self.engine.batch_stats(),
            warmer: self.warmer.stats(),
            tasks: self.tasks.status(),
        }
    }

    /// Stops background loops, then waits for the running task to finish.
    pub async fn shutdown(&self) {
        self.sync.close();
        self.warmer.close();
        self.engine.close();
        self.cache.close();
        self.tasks.shutdown().await;
        tracing::info!("Services stopped");
    }
}
