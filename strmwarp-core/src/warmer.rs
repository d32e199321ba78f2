//! Cache warming ahead of playback.
//!
//! Items are warmed at startup from the popular and recent lists, after
//! each access for adjacent items, and periodically for the popular list.
//! All warming goes through [`MediaLookup`], the same fill path live
//! requests use, and is a no-op for items already cached.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::WarmupConfig;
use crate::strm::{MediaLookup, WarmOutcome};

/// Failure of a single warm job.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WarmError {
    #[error("Warming {item_id} timed out after {after:?}")]
    Timeout { item_id: String, after: Duration },

    #[error("Warming {item_id} failed: {reason}")]
    Lookup { item_id: String, reason: String },

    #[error("Cache warmer is closed")]
    Closed,
}

/// Rolling warm-up counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WarmerStats {
    pub warmup_requests: u64,
    pub successful_warmups: u64,
    pub failed_warmups: u64,
    pub average_duration: Duration,
    pub last_warmup: Option<DateTime<Utc>>,
}

/// Result of a startup or periodic warm-up pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WarmupReport {
    pub filled: usize,
    pub already_cached: usize,
    pub failed: usize,
}

impl WarmupReport {
    fn record(&mut self, result: &Result<WarmOutcome, WarmError>) {
        match result {
            Ok(WarmOutcome::Filled) => self.filled += 1,
            Ok(WarmOutcome::AlreadyCached) => self.already_cached += 1,
            Err(_) => self.failed += 1,
        }
    }
}

#[derive(Debug, Default)]
struct StatsAccumulator {
    requests: u64,
    successes: u64,
    failures: u64,
    total_duration: Duration,
    last_warmup: Option<DateTime<Utc>>,
}

struct WarmerInner {
    lookup: Arc<MediaLookup>,
    config: WarmupConfig,
    permits: Semaphore,
    popular: Mutex<Vec<String>>,
    recent: Mutex<VecDeque<String>>,
    stats: Mutex<StatsAccumulator>,
}

/// Pre-fills the playback cache for items likely to be played next.
pub struct CacheWarmer {
    inner: Arc<WarmerInner>,
    periodic: Mutex<Option<JoinHandle<()>>>,
}

impl CacheWarmer {
    pub fn new(lookup: Arc<MediaLookup>, config: WarmupConfig) -> Self {
        let mut popular = config.popular_items.clone();
        popular.truncate(config.max_popular_items);

        Self {
            inner: Arc::new(WarmerInner {
                lookup,
                permits: Semaphore::new(config.max_concurrency.max(1)),
                popular: Mutex::new(popular),
                recent: Mutex::new(VecDeque::with_capacity(config.max_recent_items)),
                stats: Mutex::new(StatsAccumulator::default()),
                config,
            }),
            periodic: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.config.enabled
    }

    /// Warms the popular and recent lists in the background.
    ///
    /// Returns immediately; the handle resolves once every job finished.
    pub fn startup_warmup(&self) -> JoinHandle<WarmupReport> {
        let items = if self.is_enabled() {
            let mut items = self.inner.popular.lock().clone();
            for item_id in self.recent_items() {
                if !items.contains(&item_id) {
                    items.push(item_id);
                }
            }
            items
        } else {
            Vec::new()
        };

        tracing::info!("Starting cache warm-up for {} items", items.len());
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { WarmerInner::warm_all(&inner, items).await })
    }

    /// Records an access to `item_id` and warms its related items.
    ///
    /// Returns the handles of the spawned warm jobs.
    pub fn on_access(
        &self,
        item_id: &str,
    ) -> Vec<JoinHandle<Result<WarmOutcome, WarmError>>> {
        if !self.is_enabled() {
            return Vec::new();
        }

        self.touch_recent(item_id);
        related_item_ids(item_id, self.inner.config.related_items_count)
            .into_iter()
            .map(|related| self.warm_item(&related))
            .collect()
    }

    /// Spawns a single warm job bounded by the concurrency limit and the
    /// per-job deadline.
    pub fn warm_item(&self, item_id: &str) -> JoinHandle<Result<WarmOutcome, WarmError>> {
        let inner = Arc::clone(&self.inner);
        let item_id = item_id.to_string();
        tokio::spawn(async move { inner.warm(&item_id).await })
    }

    /// Starts re-warming the popular list every `interval`.
    ///
    /// Returns false if the periodic task is already running.
    pub fn start_periodic(&self) -> bool {
        let mut periodic = self.periodic.lock();
        if periodic.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }

        let interval = self.inner.config.interval.max(Duration::from_millis(1));
        let weak = Arc::downgrade(&self.inner);
        *periodic = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if inner.permits.is_closed() {
                    break;
                }
                let items = inner.popular.lock().clone();
                let report = WarmerInner::warm_all(&inner, items).await;
                tracing::debug!("Periodic warm-up finished: {report:?}");
            }
        }));
        true
    }

    /// Adds an item to the popular list, ignoring duplicates and overflow.
    pub fn add_popular(&self, item_id: &str) -> bool {
        let mut popular = self.inner.popular.lock();
        if popular.len() >= self.inner.config.max_popular_items
            || popular.iter().any(|id| id == item_id)
        {
            return false;
        }
        popular.push(item_id.to_string());
        true
    }

    pub fn popular_items(&self) -> Vec<String> {
        self.inner.popular.lock().clone()
    }

    /// Recently accessed items, most recent first.
    pub fn recent_items(&self) -> Vec<String> {
        self.inner.recent.lock().iter().cloned().collect()
    }

    pub fn stats(&self) -> WarmerStats {
        let stats = self.inner.stats.lock();
        let completed = stats.successes + stats.failures;
        let average_duration = if completed > 0 {
            stats.total_duration / u32::try_from(completed).unwrap_or(u32::MAX)
        } else {
            Duration::ZERO
        };

        WarmerStats {
            warmup_requests: stats.requests,
            successful_warmups: stats.successes,
            failed_warmups: stats.failures,
            average_duration,
            last_warmup: stats.last_warmup,
        }
    }

    /// Stops the periodic task and rejects further warm jobs.
    pub fn close(&self) {
        self.inner.permits.close();
        if let Some(handle) = self.periodic.lock().take() {
            handle.abort();
        }
    }

    fn touch_recent(&self, item_id: &str) {
        let capacity = self.inner.config.max_recent_items;
        if capacity == 0 {
            return;
        }

        let mut recent = self.inner.recent.lock();
        recent.retain(|id| id != item_id);
        recent.push_front(item_id.to_string());
        recent.truncate(capacity);
    }
}

impl Drop for CacheWarmer {
    fn drop(&mut self) {
        if let Some(handle) = self.periodic.get_mut().take() {
            handle.abort();
        }
    }
}

impl WarmerInner {
    async fn warm_all(inner: &Arc<Self>, items: Vec<String>) -> WarmupReport {
        let jobs: Vec<_> = items
            .into_iter()
            .map(|item_id| {
                let inner = Arc::clone(inner);
                tokio::spawn(async move { inner.warm(&item_id).await })
            })
            .collect();

        let mut report = WarmupReport::default();
        for result in join_all(jobs).await {
            match result {
                Ok(result) => report.record(&result),
                Err(e) => {
                    tracing::warn!("Warm job panicked or was cancelled: {e}");
                    report.failed += 1;
                }
            }
        }
        report
    }

    async fn warm(&self, item_id: &str) -> Result<WarmOutcome, WarmError> {
        let _permit = self.permits.acquire().await.map_err(|_| WarmError::Closed)?;

        self.stats.lock().requests += 1;
        let started = Instant::now();
        let deadline = self.config.timeout;

        let result = match tokio::time::timeout(deadline, self.lookup.warm(item_id)).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(e)) => Err(WarmError::Lookup {
                item_id: item_id.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(WarmError::Timeout {
                item_id: item_id.to_string(),
                after: deadline,
            }),
        };

        let mut stats = self.stats.lock();
        stats.total_duration += started.elapsed();
        stats.last_warmup = Some(Utc::now());
        match &result {
            Ok(outcome) => {
                stats.successes += 1;
                tracing::debug!("Warmed {item_id}: {outcome:?}");
            }
            Err(e) => {
                stats.failures += 1;
                tracing::debug!("{e}");
            }
        }
        result
    }
}

/// Ids of the items following `item_id` in the library.
///
/// Only numeric ids have neighbours.
pub fn related_item_ids(item_id: &str, count: usize) -> Vec<String> {
    let Ok(base) = item_id.parse::<u64>() else {
        return Vec::new();
    };

    (1..=count as u64)
        .map_while(|offset| base.checked_add(offset))
        .map(|id| id.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::StrmConfig;
    use crate::cache::PlaybackCache;
    use crate::strm::StrmClassifier;
    use crate::test_mocks::MockMediaServer;

    fn warmer_with(server: Arc<MockMediaServer>, config: WarmupConfig) -> CacheWarmer {
        let base = StrmConfig::for_testing();
        let lookup = Arc::new(MediaLookup::new(
            Arc::new(PlaybackCache::new(base.cache, base.redirect)),
            server,
            StrmClassifier::default(),
            base.dedup,
        ));
        CacheWarmer::new(lookup, config)
    }

    #[test]
    fn test_related_item_ids() {
        assert_eq!(related_item_ids("10", 3), vec!["11", "12", "13"]);
        assert!(related_item_ids("abc", 3).is_empty());
        assert!(related_item_ids("10", 0).is_empty());
        assert_eq!(related_item_ids(&u64::MAX.to_string(), 2), Vec::<String>::new());
    }

    #[tokio::test]
    async fn test_startup_warmup_fills_cache() {
        let server = Arc::new(MockMediaServer::new());
        server.add_local_item("1", "/media/a.mkv");
        server.add_local_item("2", "/media/b.mkv");

        let config = WarmupConfig {
            popular_items: vec!["1".to_string(), "2".to_string(), "404".to_string()],
            ..StrmConfig::for_testing().warmup
        };
        let warmer = warmer_with(Arc::clone(&server), config);

        let report = warmer.startup_warmup().await.unwrap();
        assert_eq!(report.filled, 2);
        assert_eq!(report.failed, 1);

        // Second pass is all cache hits
        let report = warmer.startup_warmup().await.unwrap();
        assert_eq!(report.already_cached, 2);

        let stats = warmer.stats();
        assert_eq!(stats.warmup_requests, 6);
        assert_eq!(stats.successful_warmups, 4);
        assert_eq!(stats.failed_warmups, 2);
        assert!(stats.last_warmup.is_some());
    }

    #[tokio::test]
    async fn test_on_access_tracks_recent_and_warms_neighbours() {
        let server = Arc::new(MockMediaServer::new());
        for id in ["10", "11", "12"] {
            server.add_local_item(id, &format!("/media/{id}.mkv"));
        }

        let config = WarmupConfig {
            max_recent_items: 2,
            ..StrmConfig::for_testing().warmup
        };
        let warmer = warmer_with(Arc::clone(&server), config);

        let jobs = warmer.on_access("10");
        assert_eq!(jobs.len(), 2);
        for job in jobs {
            assert_eq!(job.await.unwrap(), Ok(WarmOutcome::Filled));
        }

        warmer.on_access("a");
        warmer.on_access("10");
        warmer.on_access("b");
        assert_eq!(warmer.recent_items(), vec!["b", "10"]);
    }

    #[tokio::test]
    async fn test_warm_job_times_out() {
        let server = Arc::new(MockMediaServer::new().with_latency(Duration::from_secs(2)));
        server.add_local_item("1", "/media/a.mkv");
        let config = WarmupConfig {
            timeout: Duration::from_millis(50),
            ..StrmConfig::for_testing().warmup
        };
        let warmer = warmer_with(server, config);

        let result = warmer.warm_item("1").await.unwrap();
        assert!(matches!(result, Err(WarmError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_disabled_warmer_does_nothing() {
        let server = Arc::new(MockMediaServer::new());
        let config = WarmupConfig {
            enabled: false,
            popular_items: vec!["1".to_string()],
            ..StrmConfig::for_testing().warmup
        };
        let warmer = warmer_with(Arc::clone(&server), config);

        assert!(warmer.on_access("1").is_empty());
        assert_eq!(warmer.startup_warmup().await.unwrap(), WarmupReport::default());
        assert_eq!(server.query_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_periodic_rewarm_and_close() {
        let server = Arc::new(MockMediaServer::new());
        server.add_local_item("1", "/media/a.mkv");
        let config = WarmupConfig {
            popular_items: vec!["1".to_string()],
            interval: Duration::from_millis(30),
            ..StrmConfig::for_testing().warmup
        };
        let warmer = warmer_with(Arc::clone(&server), config);

        assert!(warmer.start_periodic());
        assert!(!warmer.start_periodic());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(warmer.stats().warmup_requests >= 2);
        assert_eq!(server.query_count.load(Ordering::SeqCst), 1);

        warmer.close();
        assert!(matches!(
            warmer.warm_item("1").await.unwrap(),
            Err(WarmError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_add_popular_respects_limit() {
        let config = WarmupConfig {
            max_popular_items: 1,
            ..StrmConfig::for_testing().warmup
        };
        let warmer = warmer_with(Arc::new(MockMediaServer::new()), config);
        assert!(warmer.add_popular("1"));
        assert!(!warmer.add_popular("1"));
        assert!(!warmer.add_popular("2"));
        assert_eq!(warmer.popular_items(), vec!["1"]);
    }
}
