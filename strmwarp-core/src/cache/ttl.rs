//! Generic keyed cache with per-entry time-to-live.
//!
//! Expired entries are never returned, whether or not the background
//! sweep has removed them yet. The lock is held only around map access.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::Instant;

use super::sweeper::Sweeper;

/// A cached value with its creation time and lifetime.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub value: T,
    pub created_at: Instant,
    pub ttl: Duration,
}

impl<T> CacheEntry<T> {
    pub fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            created_at: Instant::now(),
            ttl,
        }
    }

    /// True once strictly more than `ttl` has passed since creation.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        match self.created_at.checked_add(self.ttl) {
            Some(deadline) => now > deadline,
            None => false,
        }
    }

    /// Time left before expiry, zero if already expired.
    pub fn remaining(&self) -> Duration {
        self.ttl.saturating_sub(self.created_at.elapsed())
    }
}

/// Entry counts reported by [`KeyedTtlCache::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TtlCacheStats {
    pub total_entries: usize,
    pub expired_entries: usize,
    pub active_entries: usize,
}

type Table<T> = RwLock<HashMap<String, CacheEntry<T>>>;

/// Concurrency-safe map of string keys to time-boxed values.
///
/// Readers run concurrently; writes and sweeps are exclusive. A background
/// sweep removes expired entries every `sweep_interval` until
/// [`close`](Self::close) is called or the cache is dropped.
#[derive(Debug)]
pub struct KeyedTtlCache<T> {
    name: &'static str,
    table: Arc<Table<T>>,
    sweep_interval: Duration,
    sweeper: Sweeper,
}

impl<T> KeyedTtlCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates a cache and starts its sweep on the current runtime.
    pub fn new(name: &'static str, sweep_interval: Duration) -> Self {
        let table: Arc<Table<T>> = Arc::new(RwLock::new(HashMap::new()));
        let weak: Weak<Table<T>> = Arc::downgrade(&table);

        let sweeper = Sweeper::spawn(name, sweep_interval, move || {
            weak.upgrade().map(|table| Self::purge_table(&table))
        });

        Self {
            name,
            table,
            sweep_interval,
            sweeper,
        }
    }

    /// Returns the live value for `key`, or `None` if absent or expired.
    pub fn get(&self, key: &str) -> Option<T> {
        let table = self.table.read();
        table
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.value.clone())
    }

    /// Returns the live entry for `key` including its timing metadata.
    pub fn get_entry(&self, key: &str) -> Option<CacheEntry<T>> {
        let table = self.table.read();
        table.get(key).filter(|entry| !entry.is_expired()).cloned()
    }

    /// Stores `value`, replacing any previous entry.
    pub fn set(&self, key: impl Into<String>, value: T, ttl: Duration) {
        let entry = CacheEntry::new(value, ttl);
        self.table.write().insert(key.into(), entry);
    }

    /// Stores `value` only if no live entry exists.
    ///
    /// Returns true if the value was stored. The check and the insert
    /// happen under one write lock.
    pub fn set_if_absent(&self, key: impl Into<String>, value: T, ttl: Duration) -> bool {
        let key = key.into();
        let mut table = self.table.write();
        if table.get(&key).is_some_and(|entry| !entry.is_expired()) {
            return false;
        }
        table.insert(key, CacheEntry::new(value, ttl));
        true
    }

    /// Removes `key`. Returns true if an entry (live or expired) was present.
    pub fn delete(&self, key: &str) -> bool {
        self.table.write().remove(key).is_some()
    }

    pub fn clear(&self) {
        self.table.write().clear();
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.table
            .read()
            .values()
            .filter(|entry| !entry.is_expired_at(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> TtlCacheStats {
        let now = Instant::now();
        let table = self.table.read();
        let expired_entries = table
            .values()
            .filter(|entry| entry.is_expired_at(now))
            .count();

        TtlCacheStats {
            total_entries: table.len(),
            expired_entries,
            active_entries: table.len() - expired_entries,
        }
    }

    /// Removes every expired entry now, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        Self::purge_table(&self.table)
    }

    /// Stops the background sweep. Idempotent.
    pub fn close(&self) {
        if self.sweeper.close() {
            tracing::debug!("{}: sweep stopped", self.name);
        }
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweeper.is_running()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    fn purge_table(table: &Table<T>) -> usize {
        let now = Instant::now();
        let mut table = table.write();
        let before = table.len();
        table.retain(|_, entry| !entry.is_expired_at(now));
        before - table.len()
    }
}
