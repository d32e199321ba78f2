//! Playback cache domain: four TTL tables sharing one hit/miss counter block.
//!
//! Keys are `namespace:md5hex(identifier)` so arbitrarily long paths and
//! user agents map to fixed-length keys.

use std::sync::atomic::{AtomicU64, Ordering};

use md5::{Digest, Md5};
use serde::Serialize;

use super::ttl::{KeyedTtlCache, TtlCacheStats};
use crate::config::{CacheConfig, RedirectConfig};
use crate::strm::StrmClassification;
use crate::upstream::{ServerItem, ServerPlayback};

/// The four tables of the playback cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheTable {
    Item,
    Strm,
    Link,
    Playback,
}

impl CacheTable {
    pub fn namespace(self) -> &'static str {
        match self {
            CacheTable::Item => "item",
            CacheTable::Strm => "strm",
            CacheTable::Link => "link",
            CacheTable::Playback => "playback",
        }
    }
}

/// Resolved redirect target for one remote path and user agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RedirectEntry {
    pub url: String,
    /// Stored speculatively ahead of playback
    pub preloaded: bool,
}

#[derive(Debug, Default)]
struct TableCounters {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TableCounters {
    fn record(&self, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn snapshot(&self, entries: TtlCacheStats) -> TableStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        TableStats {
            hits,
            misses,
            hit_rate: PlaybackCacheStats::calculate_hit_rate(hits, misses),
            entries: entries.active_entries,
        }
    }

    fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

/// Counters for a single table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TableStats {
    pub hits: u64,
    pub misses: u64,
    /// Hit rate percentage
    pub hit_rate: f64,
    /// Live entries at snapshot time
    pub entries: usize,
}

/// Immutable snapshot of the playback cache counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PlaybackCacheStats {
    pub item: TableStats,
    pub strm: TableStats,
    pub link: TableStats,
    pub playback: TableStats,
    pub total: TableStats,
}

impl PlaybackCacheStats {
    /// Calculate hit rate percentage
    pub fn calculate_hit_rate(hits: u64, misses: u64) -> f64 {
        if hits + misses == 0 {
            0.0
        } else {
            (hits as f64) / ((hits + misses) as f64) * 100.0
        }
    }
}

/// Item info, strm classification, redirect link and PlaybackInfo caches.
#[derive(Debug)]
pub struct PlaybackCache {
    items: KeyedTtlCache<ServerItem>,
    strm: KeyedTtlCache<StrmClassification>,
    links: KeyedTtlCache<RedirectEntry>,
    playback: KeyedTtlCache<ServerPlayback>,
    item_counters: TableCounters,
    strm_counters: TableCounters,
    link_counters: TableCounters,
    playback_counters: TableCounters,
    total_counters: TableCounters,
    config: CacheConfig,
    redirect: RedirectConfig,
}

impl PlaybackCache {
    pub fn new(config: CacheConfig, redirect: RedirectConfig) -> Self {
        let sweep = config.sweep_interval;
        Self {
            items: KeyedTtlCache::new("playback-cache:item", sweep),
            strm: KeyedTtlCache::new("playback-cache:strm", sweep),
            links: KeyedTtlCache::new("playback-cache:link", sweep),
            playback: KeyedTtlCache::new("playback-cache:playback", sweep),
            item_counters: TableCounters::default(),
            strm_counters: TableCounters::default(),
            link_counters: TableCounters::default(),
            playback_counters: TableCounters::default(),
            total_counters: TableCounters::default(),
            config,
            redirect,
        }
    }

    /// Builds the fixed-length key for `identifier` in `table`.
    pub fn cache_key(table: CacheTable, identifier: &str) -> String {
        let digest = Md5::digest(identifier.as_bytes());
        format!("{}:{}", table.namespace(), hex::encode(digest))
    }

    pub fn get_item(&self, item_id: &str) -> Option<ServerItem> {
        let value = self.items.get(&Self::cache_key(CacheTable::Item, item_id));
        self.record(CacheTable::Item, value.is_some());
        value
    }

    pub fn set_item(&self, item_id: &str, item: ServerItem) {
        self.items.set(
            Self::cache_key(CacheTable::Item, item_id),
            item,
            self.config.item_ttl,
        );
    }

    pub fn get_strm(&self, path: &str) -> Option<StrmClassification> {
        let value = self.strm.get(&Self::cache_key(CacheTable::Strm, path));
        self.record(CacheTable::Strm, value.is_some());
        value
    }

    pub fn set_strm(&self, path: &str, classification: StrmClassification) {
        self.strm.set(
            Self::cache_key(CacheTable::Strm, path),
            classification,
            self.config.strm_ttl,
        );
    }

    pub fn get_link(&self, link_key: &str) -> Option<RedirectEntry> {
        let value = self.links.get(&Self::cache_key(CacheTable::Link, link_key));
        self.record(CacheTable::Link, value.is_some());
        value
    }

    /// Stores a speculative redirect unless a live entry already exists.
    ///
    /// Returns true if the entry was stored.
    pub fn store_preloaded(&self, link_key: &str, url: impl Into<String>) -> bool {
        self.links.set_if_absent(
            Self::cache_key(CacheTable::Link, link_key),
            RedirectEntry {
                url: url.into(),
                preloaded: true,
            },
            self.redirect.ttl,
        )
    }

    /// Stores a redirect obtained on the playback path, replacing any entry.
    pub fn store_confirmed(&self, link_key: &str, url: impl Into<String>) {
        self.links.set(
            Self::cache_key(CacheTable::Link, link_key),
            RedirectEntry {
                url: url.into(),
                preloaded: false,
            },
            self.redirect.ttl,
        );
    }

    /// Rewritten PlaybackInfo stored under a request identity.
    pub fn get_playback(&self, cache_id: &str) -> Option<ServerPlayback> {
        let value = self
            .playback
            .get(&Self::cache_key(CacheTable::Playback, cache_id));
        self.record(CacheTable::Playback, value.is_some());
        value
    }

    pub fn set_playback(&self, cache_id: &str, playback: ServerPlayback) {
        self.playback.set(
            Self::cache_key(CacheTable::Playback, cache_id),
            playback,
            self.config.playback_ttl,
        );
    }

    /// Drops the item info cached for `item_id`.
    pub fn invalidate_item(&self, item_id: &str) {
        self.items.delete(&Self::cache_key(CacheTable::Item, item_id));
    }

    /// Empties all tables and resets the counters.
    pub fn clear(&self) {
        self.items.clear();
        self.strm.clear();
        self.links.clear();
        self.playback.clear();
        for counters in [
            &self.item_counters,
            &self.strm_counters,
            &self.link_counters,
            &self.playback_counters,
            &self.total_counters,
        ] {
            counters.reset();
        }
    }

    pub fn stats(&self) -> PlaybackCacheStats {
        let item = self.items.stats();
        let strm = self.strm.stats();
        let link = self.links.stats();
        let playback = self.playback.stats();
        let total = TtlCacheStats {
            total_entries: item.total_entries
                + strm.total_entries
                + link.total_entries
                + playback.total_entries,
            expired_entries: item.expired_entries
                + strm.expired_entries
                + link.expired_entries
                + playback.expired_entries,
            active_entries: item.active_entries
                + strm.active_entries
                + link.active_entries
                + playback.active_entries,
        };

        PlaybackCacheStats {
            item: self.item_counters.snapshot(item),
            strm: self.strm_counters.snapshot(strm),
            link: self.link_counters.snapshot(link),
            playback: self.playback_counters.snapshot(playback),
            total: self.total_counters.snapshot(total),
        }
    }

    /// Stops the background sweep of every table. Idempotent.
    pub fn close(&self) {
        self.items.close();
        self.strm.close();
        self.links.close();
        self.playback.close();
    }

    fn record(&self, table: CacheTable, hit: bool) {
        let counters = match table {
            CacheTable::Item => &self.item_counters,
            CacheTable::Strm => &self.strm_counters,
            CacheTable::Link => &self.link_counters,
            CacheTable::Playback => &self.playback_counters,
        };
        counters.record(hit);
        self.total_counters.record(hit);
        tracing::debug!(
            "playback cache {} {}",
            table.namespace(),
            if hit { "hit" } else { "miss" }
        );
    }
}
