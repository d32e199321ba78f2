//! Batch deduplication: many keys under one batch key, one resolver call.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;

use super::{DedupError, RequestDeduplicator};
use crate::config::{BatchConfig, DedupConfig};

type Outcome<V, E> = Result<V, DedupError<E>>;
type BatchResolver<V, E> =
    Box<dyn FnOnce(Vec<String>) -> BoxFuture<'static, Result<HashMap<String, V>, E>> + Send>;

/// Counters reported by [`BatchDeduplicator::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    pub total_items: u64,
    pub batches_flushed: u64,
    pub size_flushes: u64,
    pub timeout_flushes: u64,
    /// Items routed to single-flight because batching was off or saturated
    pub fallbacks: u64,
    pub missing_results: u64,
    pub timeouts: u64,
    pub open_batches: usize,
}

#[derive(Debug, Default)]
struct Counters {
    total_items: AtomicU64,
    batches_flushed: AtomicU64,
    size_flushes: AtomicU64,
    timeout_flushes: AtomicU64,
    fallbacks: AtomicU64,
    missing_results: AtomicU64,
    timeouts: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
enum FlushTrigger {
    Size,
    Timeout,
}

struct OpenBatch<V, E> {
    generation: u64,
    items: Vec<(String, oneshot::Sender<Outcome<V, E>>)>,
    resolver: BatchResolver<V, E>,
}

struct BatchInner<V, E> {
    config: BatchConfig,
    open: Mutex<HashMap<String, OpenBatch<V, E>>>,
    next_generation: AtomicU64,
    counters: Counters,
}

enum Admission<V, E> {
    Queued(Option<OpenBatch<V, E>>),
    Opened(u64),
    Overflow,
}

/// Coalesces keys sharing a batch key into one multi-key resolver call.
///
/// A batch flushes exactly once: when it reaches `batch_size` items or
/// when `batch_timeout` has passed since its first item, whichever comes
/// first. The first caller's resolver serves the whole batch.
pub struct BatchDeduplicator<V, E> {
    inner: Arc<BatchInner<V, E>>,
    fallback: RequestDeduplicator<Option<V>, E>,
}

impl<V, E> BatchDeduplicator<V, E>
where
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    pub fn new(config: BatchConfig, dedup: DedupConfig) -> Self {
        Self {
            inner: Arc::new(BatchInner {
                config,
                open: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                counters: Counters::default(),
            }),
            fallback: RequestDeduplicator::new(dedup),
        }
    }

    /// Adds `item_key` to the open batch for `batch_key` and waits for its value.
    ///
    /// # Errors
    ///
    /// - `DedupError::MissingResult` - The resolver's map had no entry for `item_key`
    /// - `DedupError::Resolver` - The batch resolver failed
    /// - `DedupError::Timeout` - The batch did not resolve within `max_wait`
    pub async fn execute_batch<F, Fut>(
        &self,
        batch_key: &str,
        item_key: &str,
        resolver: F,
    ) -> Outcome<V, E>
    where
        F: FnOnce(Vec<String>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<HashMap<String, V>, E>> + Send + 'static,
    {
        let config = &self.inner.config;
        self.inner
            .counters
            .total_items
            .fetch_add(1, Ordering::Relaxed);

        if !config.enabled {
            return self.run_single(item_key, resolver).await;
        }

        let mut resolver = Some(resolver);
        let (sender, receiver) = oneshot::channel();

        let admission = {
            let mut open = self.inner.open.lock();
            if let Some(batch) = open.get_mut(batch_key) {
                batch.items.push((item_key.to_string(), sender));
                if batch.items.len() >= config.batch_size {
                    Admission::Queued(open.remove(batch_key))
                } else {
                    Admission::Queued(None)
                }
            } else if open.len() >= config.max_open_batches {
                Admission::Overflow
            } else {
                let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                let boxed: BatchResolver<V, E> = match resolver.take() {
                    Some(resolver) => Box::new(move |keys| resolver(keys).boxed()),
                    None => return Err(DedupError::MissingResult {
                        key: item_key.to_string(),
                    }),
                };
                let batch = OpenBatch {
                    generation,
                    items: vec![(item_key.to_string(), sender)],
                    resolver: boxed,
                };
                if config.batch_size <= 1 {
                    Admission::Queued(Some(batch))
                } else {
                    open.insert(batch_key.to_string(), batch);
                    Admission::Opened(generation)
                }
            }
        };

        match admission {
            Admission::Overflow => {
                return match resolver.take() {
                    Some(resolver) => self.run_single(item_key, resolver).await,
                    None => Err(DedupError::MissingResult {
                        key: item_key.to_string(),
                    }),
                };
            }
            Admission::Opened(generation) => self.schedule_timeout(batch_key, generation),
            Admission::Queued(Some(full)) => {
                tokio::spawn(Self::flush(
                    Arc::clone(&self.inner),
                    batch_key.to_string(),
                    full,
                    FlushTrigger::Size,
                ));
            }
            Admission::Queued(None) => {}
        }

        match tokio::time::timeout(config.max_wait, receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(DedupError::LeaderAborted {
                key: item_key.to_string(),
            }),
            Err(_) => {
                self.inner.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                Err(DedupError::Timeout {
                    key: item_key.to_string(),
                    waited: config.max_wait,
                })
            }
        }
    }

    pub fn stats(&self) -> BatchStats {
        let counters = &self.inner.counters;
        BatchStats {
            total_items: counters.total_items.load(Ordering::Relaxed),
            batches_flushed: counters.batches_flushed.load(Ordering::Relaxed),
            size_flushes: counters.size_flushes.load(Ordering::Relaxed),
            timeout_flushes: counters.timeout_flushes.load(Ordering::Relaxed),
            fallbacks: counters.fallbacks.load(Ordering::Relaxed),
            missing_results: counters.missing_results.load(Ordering::Relaxed),
            timeouts: counters.timeouts.load(Ordering::Relaxed),
            open_batches: self.inner.open.lock().len(),
        }
    }

    /// Stops the fallback deduplicator's sweep. Idempotent.
    pub fn close(&self) {
        self.fallback.close();
    }

    fn schedule_timeout(&self, batch_key: &str, generation: u64) {
        let inner = Arc::clone(&self.inner);
        let batch_key = batch_key.to_string();
        let delay = inner.config.batch_timeout;

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let batch = {
                let mut open = inner.open.lock();
                match open.get(&batch_key) {
                    Some(batch) if batch.generation == generation => open.remove(&batch_key),
                    _ => None,
                }
            };
            if let Some(batch) = batch {
                Self::flush(inner, batch_key, batch, FlushTrigger::Timeout).await;
            }
        });
    }

    async fn flush(
        inner: Arc<BatchInner<V, E>>,
        batch_key: String,
        batch: OpenBatch<V, E>,
        trigger: FlushTrigger,
    ) {
        let counters = &inner.counters;
        counters.batches_flushed.fetch_add(1, Ordering::Relaxed);
        match trigger {
            FlushTrigger::Size => counters.size_flushes.fetch_add(1, Ordering::Relaxed),
            FlushTrigger::Timeout => counters.timeout_flushes.fetch_add(1, Ordering::Relaxed),
        };

        let OpenBatch {
            items, resolver, ..
        } = batch;

        let mut keys: Vec<String> = Vec::with_capacity(items.len());
        for (key, _) in &items {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }
        tracing::debug!(
            "Flushing batch {batch_key} ({trigger:?}) with {} keys",
            keys.len()
        );

        match resolver(keys).await {
            Ok(values) => {
                for (key, sender) in items {
                    let outcome = match values.get(&key) {
                        Some(value) => Ok(value.clone()),
                        None => {
                            counters.missing_results.fetch_add(1, Ordering::Relaxed);
                            Err(DedupError::MissingResult { key })
                        }
                    };
                    let _ = sender.send(outcome);
                }
            }
            Err(error) => {
                tracing::warn!("Batch {batch_key} resolver failed");
                for (_, sender) in items {
                    let _ = sender.send(Err(DedupError::Resolver(error.clone())));
                }
            }
        }
    }

    async fn run_single<F, Fut>(&self, item_key: &str, resolver: F) -> Outcome<V, E>
    where
        F: FnOnce(Vec<String>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<HashMap<String, V>, E>> + Send + 'static,
    {
        self.inner.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
        let key = item_key.to_string();

        let value = self
            .fallback
            .do_request(item_key, || async move {
                let lookup = key.clone();
                resolver(vec![key])
                    .await
                    .map(|mut values| values.remove(&lookup))
            })
            .await?;

        value.ok_or_else(|| {
            self.inner
                .counters
                .missing_results
                .fetch_add(1, Ordering::Relaxed);
            DedupError::MissingResult {
                key: item_key.to_string(),
            }
        })
    }
}
