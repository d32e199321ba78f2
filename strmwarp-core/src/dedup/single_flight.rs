//! Single-flight execution: concurrent calls for one key share one resolver run.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::DedupError;
use crate::cache::sweeper::Sweeper;
use crate::config::DedupConfig;

type Outcome<V, E> = Result<V, DedupError<E>>;

/// Counters reported by [`RequestDeduplicator::stats`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DedupStats {
    pub total_requests: u64,
    /// Calls served by another caller's resolver run
    pub deduplicated_requests: u64,
    /// Calls that ran their resolver directly because the table was full
    pub bypassed_requests: u64,
    pub timeouts: u64,
    pub leader_aborts: u64,
    /// Resolver time not spent thanks to deduplication
    pub saved_time: Duration,
    /// In-flight keys at snapshot time
    pub pending_requests: usize,
}

impl DedupStats {
    /// Deduplicated share of all requests, as a percentage
    pub fn dedup_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            (self.deduplicated_requests as f64) / (self.total_requests as f64) * 100.0
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    total_requests: AtomicU64,
    deduplicated_requests: AtomicU64,
    bypassed_requests: AtomicU64,
    timeouts: AtomicU64,
    leader_aborts: AtomicU64,
    saved_time_micros: AtomicU64,
}

struct PendingState<V, E> {
    waiters: Vec<oneshot::Sender<Outcome<V, E>>>,
    /// Set once the leader finishes, for callers that joined just before removal
    outcome: Option<Outcome<V, E>>,
}

struct PendingRequest<V, E> {
    started_at: Instant,
    state: Mutex<PendingState<V, E>>,
}

impl<V, E> PendingRequest<V, E> {
    fn new() -> Self {
        Self {
            started_at: Instant::now(),
            state: Mutex::new(PendingState {
                waiters: Vec::new(),
                outcome: None,
            }),
        }
    }
}

struct DedupInner<V, E> {
    config: DedupConfig,
    pending: Mutex<HashMap<String, Arc<PendingRequest<V, E>>>>,
    counters: Counters,
}

impl<V, E> DedupInner<V, E> {
    /// Removes `key` only if it still maps to `request`.
    fn release(&self, key: &str, request: &Arc<PendingRequest<V, E>>) {
        let mut pending = self.pending.lock();
        if pending
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, request))
        {
            pending.remove(key);
        }
    }

    fn purge_stale(&self) -> usize {
        let max_age = self.config.max_wait.saturating_mul(2);
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|_, request| request.started_at.elapsed() <= max_age);
        before - pending.len()
    }
}

enum Role<V, E> {
    Leader(Arc<PendingRequest<V, E>>),
    Waiter(oneshot::Receiver<Outcome<V, E>>),
    Finished(Outcome<V, E>),
    Bypass,
}

/// Collapses concurrent calls for the same key into one resolver run.
///
/// The first caller for a key becomes the leader and runs its resolver;
/// callers arriving while it runs wait for the leader's result, up to
/// `max_wait`. Each in-flight key has its own waiter lock so a slow
/// leader never blocks admission of other keys.
pub struct RequestDeduplicator<V, E> {
    inner: Arc<DedupInner<V, E>>,
    sweeper: Sweeper,
}

impl<V, E> RequestDeduplicator<V, E>
where
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Creates a deduplicator and starts its stale-entry sweep.
    pub fn new(config: DedupConfig) -> Self {
        let sweep_interval = config.sweep_interval;
        let inner = Arc::new(DedupInner {
            config,
            pending: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        });

        let weak: Weak<DedupInner<V, E>> = Arc::downgrade(&inner);
        let sweeper = Sweeper::spawn("request-dedup", sweep_interval, move || {
            weak.upgrade().map(|inner| inner.purge_stale())
        });

        Self { inner, sweeper }
    }

    /// Runs `resolver` for `key`, or waits for a concurrent run of the same key.
    ///
    /// # Errors
    ///
    /// - `DedupError::Resolver` - The resolver (own or leader's) failed
    /// - `DedupError::Timeout` - Waited longer than `max_wait` for the leader
    /// - `DedupError::LeaderAborted` - The leader was cancelled before finishing
    pub async fn do_request<F, Fut>(&self, key: &str, resolver: F) -> Outcome<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let counters = &self.inner.counters;
        counters.total_requests.fetch_add(1, Ordering::Relaxed);

        if !self.inner.config.enabled {
            return resolver().await.map_err(DedupError::Resolver);
        }

        match self.admit(key) {
            Role::Leader(request) => self.lead(key, request, resolver).await,
            Role::Waiter(receiver) => self.wait(key, receiver).await,
            Role::Finished(outcome) => {
                counters
                    .deduplicated_requests
                    .fetch_add(1, Ordering::Relaxed);
                outcome
            }
            Role::Bypass => {
                counters.bypassed_requests.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Dedup table full, bypassing for {key}");
                resolver().await.map_err(DedupError::Resolver)
            }
        }
    }

    pub fn stats(&self) -> DedupStats {
        let counters = &self.inner.counters;
        DedupStats {
            total_requests: counters.total_requests.load(Ordering::Relaxed),
            deduplicated_requests: counters.deduplicated_requests.load(Ordering::Relaxed),
            bypassed_requests: counters.bypassed_requests.load(Ordering::Relaxed),
            timeouts: counters.timeouts.load(Ordering::Relaxed),
            leader_aborts: counters.leader_aborts.load(Ordering::Relaxed),
            saved_time: Duration::from_micros(counters.saved_time_micros.load(Ordering::Relaxed)),
            pending_requests: self.pending_count(),
        }
    }

    /// Keys currently being resolved.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Removes in-flight entries older than twice `max_wait` now.
    pub fn purge_stale(&self) -> usize {
        self.inner.purge_stale()
    }

    /// Stops the stale-entry sweep. Idempotent.
    pub fn close(&self) {
        self.sweeper.close();
    }

    fn admit(&self, key: &str) -> Role<V, E> {
        let existing = {
            let mut pending = self.inner.pending.lock();
            match pending.get(key) {
                Some(request) => Arc::clone(request),
                None if pending.len() >= self.inner.config.max_pending => return Role::Bypass,
                None => {
                    let request = Arc::new(PendingRequest::new());
                    pending.insert(key.to_string(), Arc::clone(&request));
                    return Role::Leader(request);
                }
            }
        };

        // Table lock released; join through the request's own lock
        let mut state = existing.state.lock();
        if let Some(outcome) = &state.outcome {
            return Role::Finished(outcome.clone());
        }
        let (sender, receiver) = oneshot::channel();
        state.waiters.push(sender);
        Role::Waiter(receiver)
    }

    async fn lead<F, Fut>(
        &self,
        key: &str,
        request: Arc<PendingRequest<V, E>>,
        resolver: F,
    ) -> Outcome<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let mut guard = LeaderGuard {
            inner: self.inner.as_ref(),
            key,
            request,
            completed: false,
        };

        let outcome = resolver().await.map_err(DedupError::Resolver);
        guard.complete(outcome.clone());
        outcome
    }

    async fn wait(&self, key: &str, receiver: oneshot::Receiver<Outcome<V, E>>) -> Outcome<V, E> {
        let max_wait = self.inner.config.max_wait;
        let counters = &self.inner.counters;

        match tokio::time::timeout(max_wait, receiver).await {
            Ok(Ok(outcome)) => {
                counters
                    .deduplicated_requests
                    .fetch_add(1, Ordering::Relaxed);
                outcome
            }
            Ok(Err(_)) => Err(DedupError::LeaderAborted {
                key: key.to_string(),
            }),
            Err(_) => {
                counters.timeouts.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Request deduplication timeout for {key} after {max_wait:?}");
                Err(DedupError::Timeout {
                    key: key.to_string(),
                    waited: max_wait,
                })
            }
        }
    }
}

/// Publishes the leader's outcome, or an abort if the leader is dropped first.
struct LeaderGuard<'a, V, E> {
    inner: &'a DedupInner<V, E>,
    key: &'a str,
    request: Arc<PendingRequest<V, E>>,
    completed: bool,
}

impl<V: Clone, E: Clone> LeaderGuard<'_, V, E> {
    fn complete(&mut self, outcome: Outcome<V, E>) {
        self.completed = true;
        let waiters = {
            let mut state = self.request.state.lock();
            state.outcome = Some(outcome.clone());
            std::mem::take(&mut state.waiters)
        };
        self.inner.release(self.key, &self.request);

        if !waiters.is_empty() {
            let elapsed = self.request.started_at.elapsed();
            let saved = elapsed.saturating_mul(waiters.len() as u32);
            self.inner
                .counters
                .saved_time_micros
                .fetch_add(saved.as_micros() as u64, Ordering::Relaxed);
            tracing::debug!(
                "Broadcasting result for {} to {} waiters",
                self.key,
                waiters.len()
            );
        }

        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }
}

impl<V, E> Drop for LeaderGuard<'_, V, E> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        self.inner
            .counters
            .leader_aborts
            .fetch_add(1, Ordering::Relaxed);
        let waiters = std::mem::take(&mut self.request.state.lock().waiters);
        self.inner.release(self.key, &self.request);
        tracing::debug!("Leader for {} dropped with {} waiters", self.key, waiters.len());
        // Dropping the senders wakes every waiter with LeaderAborted
        drop(waiters);
    }
}
