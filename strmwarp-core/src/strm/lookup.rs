//! Cache-first item and classification lookups.
//!
//! Live requests and the cache warmer both fill the playback cache through
//! this type, so they observe the same consistency rules.

use std::collections::HashMap;
use std::sync::Arc;

use super::{StrmClassification, StrmClassifier};
use crate::cache::PlaybackCache;
use crate::config::DedupConfig;
use crate::dedup::{DedupError, DedupStats, RequestDeduplicator};
use crate::upstream::{MediaServerClient, PLAYBACK_FIELDS, ServerItem, UpstreamError};

/// Error from an item lookup.
pub type LookupError = DedupError<UpstreamError>;

/// Result of warming a single item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarmOutcome {
    /// Item was already cached; nothing fetched
    AlreadyCached,
    /// Item and its classification were fetched and cached
    Filled,
}

/// Item info and strm classification with cache, dedup and upstream tiers.
pub struct MediaLookup {
    cache: Arc<PlaybackCache>,
    upstream: Arc<dyn MediaServerClient>,
    classifier: StrmClassifier,
    item_dedup: RequestDeduplicator<ServerItem, UpstreamError>,
}

impl MediaLookup {
    pub fn new(
        cache: Arc<PlaybackCache>,
        upstream: Arc<dyn MediaServerClient>,
        classifier: StrmClassifier,
        dedup: DedupConfig,
    ) -> Self {
        Self {
            cache,
            upstream,
            classifier,
            item_dedup: RequestDeduplicator::new(dedup),
        }
    }

    pub fn cache(&self) -> &Arc<PlaybackCache> {
        &self.cache
    }

    pub fn upstream(&self) -> &Arc<dyn MediaServerClient> {
        &self.upstream
    }

    pub fn classifier(&self) -> &StrmClassifier {
        &self.classifier
    }

    /// Loads item info, collapsing concurrent upstream queries for one id.
    ///
    /// # Errors
    ///
    /// - `DedupError::Resolver` - The upstream query failed
    /// - `DedupError::Timeout` - A concurrent query took longer than `max_wait`
    pub async fn item(&self, item_id: &str) -> Result<ServerItem, LookupError> {
        if let Some(item) = self.cache.get_item(item_id) {
            return Ok(item);
        }

        let key = format!("item:{item_id}");
        self.item_dedup
            .do_request(&key, || async {
                let item = self
                    .upstream
                    .query_item(item_id, 1, PLAYBACK_FIELDS)
                    .await?;
                self.cache.set_item(item_id, item.clone());
                Ok::<_, UpstreamError>(item)
            })
            .await
    }

    /// Fetches several items in one upstream call and caches them.
    ///
    /// # Errors
    ///
    /// - `UpstreamError` - The upstream query failed
    pub async fn fetch_items(
        &self,
        item_ids: &[String],
    ) -> Result<HashMap<String, ServerItem>, UpstreamError> {
        let items = self.upstream.query_items(item_ids).await?;
        for (item_id, item) in &items {
            self.cache.set_item(item_id, item.clone());
        }
        Ok(items)
    }

    /// Classifies a stored media path, caching the result.
    pub async fn classification(&self, path: &str) -> StrmClassification {
        if let Some(classification) = self.cache.get_strm(path) {
            return classification;
        }

        let classification = self.classifier.classify(path).await;
        tracing::debug!("Classified {path} as {classification:?}");
        self.cache.set_strm(path, classification.clone());
        classification
    }

    /// Fills the cache for `item_id` unless it is already present.
    ///
    /// # Errors
    ///
    /// - `LookupError` - The item could not be loaded
    pub async fn warm(&self, item_id: &str) -> Result<WarmOutcome, LookupError> {
        if self.cache.get_item(item_id).is_some() {
            return Ok(WarmOutcome::AlreadyCached);
        }

        let item = self.item(item_id).await?;
        if let Some(path) = item.path() {
            self.classification(path).await;
        }
        Ok(WarmOutcome::Filled)
    }

    pub fn item_dedup_stats(&self) -> DedupStats {
        self.item_dedup.stats()
    }

    /// Stops the background sweep of the item deduplicator.
    pub fn close(&self) {
        self.item_dedup.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::*;
    use crate::config::{CacheConfig, RedirectConfig};
    use crate::test_mocks::MockMediaServer;

    fn lookup(server: Arc<MockMediaServer>) -> MediaLookup {
        MediaLookup::new(
            Arc::new(PlaybackCache::new(
                CacheConfig::default(),
                RedirectConfig::default(),
            )),
            server,
            StrmClassifier::default(),
            DedupConfig::default(),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_item_lookups_query_upstream_once() {
        let server = Arc::new(
            MockMediaServer::new().with_latency(Duration::from_millis(50)),
        );
        server.add_strm_item("31", "/mnt/a.strm", "115://movies/a.mkv");
        let lookup = Arc::new(lookup(Arc::clone(&server)));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let lookup = Arc::clone(&lookup);
            handles.push(tokio::spawn(async move { lookup.item("31").await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().id(), "31");
        }

        assert_eq!(server.query_count.load(Ordering::SeqCst), 1);
        // Served from cache afterwards
        lookup.item("31").await.unwrap();
        assert_eq!(server.query_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_upstream_failure_is_reported() {
        let server = Arc::new(MockMediaServer::new_with_query_failure());
        let lookup = lookup(server);
        let result = lookup.item("1").await;
        assert!(matches!(result, Err(DedupError::Resolver(UpstreamError::Request { .. }))));
    }

    #[tokio::test]
    async fn test_warm_is_noop_on_hit() {
        let server = Arc::new(MockMediaServer::new());
        server.add_local_item("5", "/media/movie.mkv");
        let lookup = lookup(Arc::clone(&server));

        assert_eq!(lookup.warm("5").await.unwrap(), WarmOutcome::Filled);
        assert_eq!(lookup.warm("5").await.unwrap(), WarmOutcome::AlreadyCached);
        assert_eq!(server.query_count.load(Ordering::SeqCst), 1);
        assert_eq!(
            lookup.cache().get_strm("/media/movie.mkv"),
            Some(StrmClassification::LocalFile)
        );
    }

    #[tokio::test]
    async fn test_fetch_items_populates_cache() {
        let server = Arc::new(MockMediaServer::new());
        server.add_local_item("1", "/media/a.mkv");
        server.add_local_item("2", "/media/b.mkv");
        let lookup = lookup(Arc::clone(&server));

        let items = lookup
            .fetch_items(&["1".to_string(), "2".to_string(), "3".to_string()])
            .await
            .unwrap();
        assert_eq!(items.len(), 2);
        assert!(lookup.cache().get_item("2").is_some());
        assert_eq!(server.batch_query_count.load(Ordering::SeqCst), 1);
    }
}
