//! In-memory caches with per-entry TTL and background expiry sweeps.

mod playback;
pub(crate) mod sweeper;
mod ttl;

pub use playback::{CacheTable, PlaybackCache, PlaybackCacheStats, RedirectEntry, TableStats};
pub use ttl::{CacheEntry, KeyedTtlCache, TtlCacheStats};
