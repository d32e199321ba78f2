//! Request deduplication.
//!
//! [`RequestDeduplicator`] collapses concurrent identical lookups into one
//! resolver run. [`BatchDeduplicator`] coalesces many keys under a shared
//! batch key into one multi-key resolver call.

mod batch;
mod single_flight;

use std::time::Duration;

pub use batch::{BatchDeduplicator, BatchStats};
pub use single_flight::{DedupStats, RequestDeduplicator};

/// Errors returned to a deduplicated caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DedupError<E> {
    #[error("request deduplication timeout for {key} after {waited:?}")]
    Timeout { key: String, waited: Duration },

    #[error("no result produced for {key}")]
    MissingResult { key: String },

    #[error("in-flight request for {key} was dropped before completing")]
    LeaderAborted { key: String },

    #[error("resolver failed: {0}")]
    Resolver(E),
}

impl<E> DedupError<E> {
    /// Returns the resolver's own error, if that is what failed.
    pub fn into_resolver_error(self) -> Option<E> {
        match self {
            DedupError::Resolver(error) => Some(error),
            _ => None,
        }
    }
}
