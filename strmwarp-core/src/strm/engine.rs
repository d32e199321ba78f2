//! Stream resolution: pass-through or redirect for a media source request.
//!
//! Every failure degrades to [`Resolution::Pass`]; the caller then hands
//! the request to the reverse proxy untouched.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;

use super::lookup::{LookupError, MediaLookup};
use super::playback_info::{media_source_ids, rewrite_playback_info};
use super::StrmClassification;
use crate::config::{BatchConfig, DedupConfig, RedirectConfig, ResolverConfig};
use crate::dedup::{BatchDeduplicator, BatchStats, DedupError, DedupStats, RequestDeduplicator};
use crate::remote::{RemoteLinkResolver, RemoteTarget, ResolveError, is_http_url};
use crate::upstream::{ServerItem, ServerPlayback, UpstreamError, strip_media_source_prefix};
use crate::warmer::CacheWarmer;

const PLAYBACK_BATCH_KEY: &str = "playback-info";

/// Decision for a stream request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Forward the request to the upstream server unchanged
    Pass,
    /// Answer with a 302 to this URL
    Redirect(String),
}

/// Result of a speculative redirect preload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreloadOutcome {
    Stored,
    AlreadyCached,
    /// No user agent, not a strm item, or no remote media source
    NotApplicable,
    Failed(String),
}

/// Resolves media sources to redirect targets through the cache and dedup layers.
pub struct ResolutionEngine {
    lookup: Arc<MediaLookup>,
    resolver: Arc<dyn RemoteLinkResolver>,
    link_dedup: RequestDeduplicator<String, ResolveError>,
    item_batch: BatchDeduplicator<ServerItem, UpstreamError>,
    resolver_config: ResolverConfig,
    redirect_config: RedirectConfig,
    warmer: Option<Arc<CacheWarmer>>,
}

impl ResolutionEngine {
    pub fn new(
        lookup: Arc<MediaLookup>,
        resolver: Arc<dyn RemoteLinkResolver>,
        dedup: DedupConfig,
        batch: BatchConfig,
        resolver_config: ResolverConfig,
        redirect_config: RedirectConfig,
    ) -> Self {
        Self {
            lookup,
            resolver,
            link_dedup: RequestDeduplicator::new(dedup.clone()),
            item_batch: BatchDeduplicator::new(batch, dedup),
            resolver_config,
            redirect_config,
            warmer: None,
        }
    }

    /// Attaches a warmer notified after every successful redirect.
    pub fn with_warmer(mut self, warmer: Arc<CacheWarmer>) -> Self {
        self.warmer = Some(warmer);
        self
    }

    pub fn lookup(&self) -> &Arc<MediaLookup> {
        &self.lookup
    }

    /// Decides how to serve a stream request.
    ///
    /// The item id is the media source id without its `mediasource_`
    /// prefix; without a media source id it is taken from the
    /// `/videos/{id}/` segment of `request_path` and the item's first
    /// media source is used.
    pub async fn resolve(
        &self,
        media_source_id: &str,
        request_path: &str,
        user_agent: &str,
    ) -> Resolution {
        let item_id = if media_source_id.is_empty() {
            match item_id_from_path(request_path) {
                Some(item_id) => item_id,
                None => return Resolution::Pass,
            }
        } else {
            strip_media_source_prefix(media_source_id)
        };

        let item = match self.lookup.item(item_id).await {
            Ok(item) => item,
            Err(e) => {
                tracing::warn!("Item lookup for {item_id} failed, passing through: {e}");
                return Resolution::Pass;
            }
        };

        let Some(item_path) = item.path() else {
            return Resolution::Pass;
        };
        let classification = self.lookup.classification(item_path).await;
        if !classification.is_strm() {
            tracing::debug!("{item_path} is not a strm, passing through");
            return Resolution::Pass;
        }

        let source = if media_source_id.is_empty() {
            item.media_sources().first()
        } else {
            item.find_media_source(media_source_id)
        };
        let Some(target) = source.and_then(|source| source.path.as_deref()) else {
            tracing::warn!("No media source path for {media_source_id} on item {item_id}");
            return Resolution::Pass;
        };

        let resolution = self.resolve_target(target, user_agent).await;
        if let (Resolution::Redirect(url), Some(warmer)) = (&resolution, &self.warmer) {
            tracing::info!("Redirecting {item_id} to {url}");
            warmer.on_access(item_id);
        }
        resolution
    }

    /// Resolves a media source path: remote references through the link
    /// cache, literal HTTP(S) URLs directly, anything else passes.
    pub async fn resolve_target(&self, target: &str, user_agent: &str) -> Resolution {
        if let Some(remote) = RemoteTarget::parse(target) {
            return match self.remote_url(&remote, user_agent).await {
                Ok(url) => Resolution::Redirect(url),
                Err(e) => {
                    tracing::warn!("Resolving {remote} failed, passing through: {e}");
                    Resolution::Pass
                }
            };
        }

        if is_http_url(target) {
            return Resolution::Redirect(target.trim().to_string());
        }

        tracing::debug!("Unresolvable strm target {target}, passing through");
        Resolution::Pass
    }

    /// Resolves a remote target, reusing cached and in-flight resolutions.
    ///
    /// # Errors
    ///
    /// - `DedupError::Resolver` - The resolver failed or exceeded its deadline
    /// - `DedupError::Timeout` - Waited too long on a concurrent resolution
    pub async fn remote_url(
        &self,
        target: &RemoteTarget,
        user_agent: &str,
    ) -> Result<String, DedupError<ResolveError>> {
        let key = target.cache_key(user_agent, self.redirect_config.strip_scheme_in_key);
        let cache = self.lookup.cache();

        if let Some(entry) = cache.get_link(&key) {
            tracing::debug!("Redirect cache hit for {key} (preloaded: {})", entry.preloaded);
            return Ok(entry.url);
        }

        self.link_dedup
            .do_request(&key, || async {
                let url = self.download_with_deadline(target, user_agent).await?;
                cache.store_confirmed(&key, url.clone());
                Ok::<_, ResolveError>(url)
            })
            .await
    }

    /// Resolves the first remote media source of an item ahead of playback
    /// and stores it as a preloaded redirect.
    pub async fn preload(&self, item_id: &str, user_agent: &str) -> PreloadOutcome {
        if user_agent.trim().is_empty() {
            return PreloadOutcome::NotApplicable;
        }

        let item = match self.lookup.item(item_id).await {
            Ok(item) => item,
            Err(e) => return PreloadOutcome::Failed(e.to_string()),
        };
        let Some(item_path) = item.path() else {
            return PreloadOutcome::NotApplicable;
        };
        if !self.lookup.classification(item_path).await.is_strm() {
            return PreloadOutcome::NotApplicable;
        }

        let Some(target) = item
            .media_sources()
            .first()
            .and_then(|source| source.path.as_deref())
            .and_then(RemoteTarget::parse)
        else {
            return PreloadOutcome::NotApplicable;
        };

        let key = target.cache_key(user_agent, self.redirect_config.strip_scheme_in_key);
        let cache = self.lookup.cache();
        if cache.get_link(&key).is_some() {
            return PreloadOutcome::AlreadyCached;
        }

        let result = self
            .link_dedup
            .do_request(&key, || async {
                let url = self.download_with_deadline(&target, user_agent).await?;
                cache.store_preloaded(&key, url.clone());
                Ok::<_, ResolveError>(url)
            })
            .await;

        match result {
            Ok(url) => {
                tracing::info!("Preloaded redirect for item {item_id}: {url}");
                PreloadOutcome::Stored
            }
            Err(e) => PreloadOutcome::Failed(e.to_string()),
        }
    }

    /// Classifies the item behind each media source id, coalescing
    /// uncached item lookups into batched upstream queries.
    ///
    /// Ids whose item cannot be loaded are absent from the result.
    pub async fn playback_overrides(
        &self,
        media_source_ids: &[String],
    ) -> HashMap<String, StrmClassification> {
        let decisions = join_all(
            media_source_ids
                .iter()
                .map(|id| async move { (id.clone(), self.classify_media_source(id).await) }),
        )
        .await;

        decisions
            .into_iter()
            .filter_map(|(id, decision)| decision.map(|decision| (id, decision)))
            .collect()
    }

    /// PlaybackInfo previously rewritten under `cache_id`.
    pub fn cached_playback(&self, cache_id: &str) -> Option<ServerPlayback> {
        self.lookup.cache().get_playback(cache_id)
    }

    /// Rewrites a PlaybackInfo body so strm sources play directly, caching
    /// the rewritten body under `cache_id`.
    ///
    /// The body carries the client's token, so `cache_id` must identify the
    /// request and not just the item.
    pub async fn rewrite_playback(
        &self,
        item_id: &str,
        cache_id: &str,
        mut body: Value,
    ) -> ServerPlayback {
        let kind = self.lookup.upstream().kind();
        let ids = media_source_ids(&body);
        let decisions = self.playback_overrides(&ids).await;
        let rewritten = rewrite_playback_info(&mut body, &decisions, item_id);
        tracing::debug!("Rewrote {rewritten} of {} media sources for {item_id}", ids.len());

        let playback = ServerPlayback::from_body(kind, body);
        self.lookup.cache().set_playback(cache_id, playback.clone());
        playback
    }

    pub fn link_dedup_stats(&self) -> DedupStats {
        self.link_dedup.stats()
    }

    pub fn batch_stats(&self) -> BatchStats {
        self.item_batch.stats()
    }

    /// Stops background sweeps owned by the engine.
    pub fn close(&self) {
        self.link_dedup.close();
        self.item_batch.close();
        self.lookup.close();
    }

    async fn classify_media_source(&self, media_source_id: &str) -> Option<StrmClassification> {
        let item_id = strip_media_source_prefix(media_source_id).to_string();

        let item = match self.lookup.cache().get_item(&item_id) {
            Some(item) => item,
            None => {
                let lookup = Arc::clone(&self.lookup);
                let result: Result<ServerItem, LookupError> = self
                    .item_batch
                    .execute_batch(PLAYBACK_BATCH_KEY, &item_id, move |ids| async move {
                        lookup.fetch_items(&ids).await
                    })
                    .await;
                match result {
                    Ok(item) => item,
                    Err(e) => {
                        tracing::warn!("PlaybackInfo lookup for {item_id} failed: {e}");
                        return None;
                    }
                }
            }
        };

        let path = item.path()?;
        Some(self.lookup.classification(path).await)
    }

    async fn download_with_deadline(
        &self,
        target: &RemoteTarget,
        user_agent: &str,
    ) -> Result<String, ResolveError> {
        let deadline = self.resolver_config.timeout;
        match tokio::time::timeout(deadline, self.resolver.download_url(target, user_agent)).await
        {
            Ok(result) => result,
            Err(_) => Err(ResolveError::Timeout {
                target: target.to_string(),
                after: deadline,
            }),
        }
    }
}

/// Extracts `{id}` from `/videos/{id}/...` or `/emby/videos/{id}/...`.
pub fn item_id_from_path(request_path: &str) -> Option<&str> {
    let mut segments = request_path.split('/').filter(|s| !s.is_empty());
    let mut segment = segments.next()?;
    if segment.eq_ignore_ascii_case("emby") {
        segment = segments.next()?;
    }
    if !segment.eq_ignore_ascii_case("videos") {
        return None;
    }
    segments.next().filter(|id| !id.is_empty())
}
