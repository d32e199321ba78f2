//! Stoppable background sweep loop shared by caches and the deduplicator.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Periodic sweep task bound to the lifetime of its owner.
///
/// The sweep closure returns `None` once its target has been dropped,
/// which ends the loop. Closing or dropping the sweeper aborts the task.
#[derive(Debug)]
pub(crate) struct Sweeper {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Sweeper {
    /// Spawns the sweep loop on the current runtime.
    ///
    /// Outside a runtime no task is spawned; expired entries are then only
    /// hidden on read and removed by explicit purges.
    pub(crate) fn spawn<F>(label: &'static str, interval: Duration, mut sweep: F) -> Self
    where
        F: FnMut() -> Option<usize> + Send + 'static,
    {
        let interval = interval.max(Duration::from_millis(1));

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => Some(runtime.spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // First tick completes immediately
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    match sweep() {
                        Some(0) => {}
                        Some(removed) => {
                            tracing::debug!("{label}: swept {removed} stale entries");
                        }
                        None => break,
                    }
                }
            })),
            Err(_) => {
                tracing::debug!("{label}: no runtime available, background sweep disabled");
                None
            }
        };

        Self {
            handle: Mutex::new(handle),
        }
    }

    /// Stops the sweep loop. Returns false if it was already stopped.
    pub(crate) fn close(&self) -> bool {
        match self.handle.lock().take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn test_sweeper_runs_until_closed() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticks_clone = Arc::clone(&ticks);

        let sweeper = Sweeper::spawn("test", Duration::from_millis(10), move || {
            ticks_clone.fetch_add(1, Ordering::SeqCst);
            Some(0)
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(sweeper.is_running());
        assert!(ticks.load(Ordering::SeqCst) >= 2);

        assert!(sweeper.close());
        assert!(!sweeper.close());

        tokio::task::yield_now().await;
        let after_close = ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), after_close);
    }

    #[tokio::test]
    async fn test_sweeper_stops_when_target_gone() {
        let sweeper = Sweeper::spawn("test", Duration::from_millis(5), || None);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!sweeper.is_running());
    }

    #[test]
    fn test_sweeper_without_runtime() {
        let sweeper = Sweeper::spawn("test", Duration::from_millis(5), || Some(0));
        assert!(!sweeper.is_running());
        assert!(!sweeper.close());
    }
}
