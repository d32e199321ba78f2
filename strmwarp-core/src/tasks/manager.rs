//! Serialized execution of long-running external jobs.
//!
//! A single actor owns the run slot and consumes submissions from a
//! channel. Handles record queued names under the same lock that guards
//! the channel send, so the visible queue order, channel order and
//! admission order coincide.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::TaskConfig;

/// Errors from submitting to or waiting on the task manager.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("Task manager has shut down")]
    Shutdown,

    #[error("Task queue is full ({capacity} pending)")]
    QueueFull { capacity: usize },
}

/// How a task ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed,
    Failed(String),
    TimedOut,
}

/// Lifecycle of the run slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPhase {
    Idle,
    Running,
    Cooldown,
}

/// Snapshot of the manager for observability.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub running: bool,
    pub phase: TaskPhase,
    pub current_task: Option<String>,
    pub current_task_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed_secs: Option<f64>,
    pub queued: Vec<String>,
    pub queue_length: usize,
}

/// Receipt for a submitted task.
#[derive(Debug)]
pub struct TaskTicket {
    pub id: Uuid,
    pub name: String,
    outcome: oneshot::Receiver<TaskOutcome>,
}

impl TaskTicket {
    /// Waits for the task to finish.
    ///
    /// # Errors
    ///
    /// - `TaskError::Shutdown` - The manager stopped before running the task
    pub async fn wait(self) -> Result<TaskOutcome, TaskError> {
        self.outcome.await.map_err(|_| TaskError::Shutdown)
    }
}

type TaskJob = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), String>> + Send>;

struct TaskSubmission {
    id: Uuid,
    name: String,
    job: TaskJob,
    responder: oneshot::Sender<TaskOutcome>,
}

#[derive(Debug)]
struct RunningTask {
    id: Uuid,
    name: String,
    started_at: DateTime<Utc>,
    started: Instant,
}

#[derive(Debug)]
struct TaskState {
    phase: TaskPhase,
    current: Option<RunningTask>,
    queue: VecDeque<(Uuid, String)>,
}

/// Handle to the process-wide task manager.
///
/// Clones share the same actor.
#[derive(Clone)]
pub struct TaskManager {
    sender: mpsc::Sender<TaskSubmission>,
    state: Arc<Mutex<TaskState>>,
    shutdown: Arc<watch::Sender<bool>>,
    actor: Arc<Mutex<Option<JoinHandle<()>>>>,
    capacity: usize,
}

impl TaskManager {
    /// Spawns the manager actor on the current runtime.
    pub fn spawn(config: TaskConfig) -> Self {
        let capacity = config.command_buffer.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let state = Arc::new(Mutex::new(TaskState {
            phase: TaskPhase::Idle,
            current: None,
            queue: VecDeque::new(),
        }));

        let actor = tokio::spawn(run_actor_loop(
            config,
            Arc::clone(&state),
            receiver,
            shutdown_rx,
        ));

        Self {
            sender,
            state,
            shutdown: Arc::new(shutdown),
            actor: Arc::new(Mutex::new(Some(actor))),
            capacity,
        }
    }

    /// Queues `job` under `name` and returns immediately.
    ///
    /// Jobs run one at a time in submission order, each followed by the
    /// configured cooldown.
    ///
    /// # Errors
    ///
    /// - `TaskError::Shutdown` - The manager is no longer accepting tasks
    /// - `TaskError::QueueFull` - `command_buffer` submissions are already pending
    pub fn run_task_with_name<F, Fut, E>(
        &self,
        name: impl Into<String>,
        job: F,
    ) -> Result<TaskTicket, TaskError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + 'static,
    {
        let name = name.into();
        let id = Uuid::new_v4();
        let (responder, outcome) = oneshot::channel();
        let job: TaskJob =
            Box::new(move || job().map(|result| result.map_err(|e| e.to_string())).boxed());

        let mut state = self.state.lock();
        self.sender
            .try_send(TaskSubmission {
                id,
                name: name.clone(),
                job,
                responder,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => TaskError::QueueFull {
                    capacity: self.capacity,
                },
                mpsc::error::TrySendError::Closed(_) => TaskError::Shutdown,
            })?;
        state.queue.push_back((id, name.clone()));
        let position = state.queue.len();
        drop(state);

        tracing::info!("Task {name} ({id}) queued at position {position}");
        Ok(TaskTicket { id, name, outcome })
    }

    pub fn status(&self) -> TaskStatus {
        let state = self.state.lock();
        let current = state.current.as_ref();

        TaskStatus {
            running: state.phase != TaskPhase::Idle,
            phase: state.phase,
            current_task: current.map(|task| task.name.clone()),
            current_task_id: current.map(|task| task.id),
            started_at: current.map(|task| task.started_at),
            elapsed_secs: current.map(|task| task.started.elapsed().as_secs_f64()),
            queued: state.queue.iter().map(|(_, name)| name.clone()).collect(),
            queue_length: state.queue.len(),
        }
    }

    /// Stops the actor once the current task finishes. Queued tasks are
    /// dropped and their tickets resolve to [`TaskError::Shutdown`].
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let actor = self.actor.lock().take();
        if let Some(actor) = actor {
            if let Err(e) = actor.await {
                tracing::warn!("Task manager actor ended abnormally: {e}");
            }
        }
    }
}

async fn run_actor_loop(
    config: TaskConfig,
    state: Arc<Mutex<TaskState>>,
    mut receiver: mpsc::Receiver<TaskSubmission>,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::debug!("Task manager actor started");

    loop {
        let submission = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            submission = receiver.recv() => match submission {
                Some(submission) => submission,
                None => break,
            },
        };

        run_submission(&config, &state, submission).await;

        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                state.lock().phase = TaskPhase::Idle;
                break;
            }
            _ = tokio::time::sleep(config.cooldown) => {}
        }

        let mut state = state.lock();
        state.phase = TaskPhase::Idle;
        state.current = None;
    }

    receiver.close();
    let mut state = state.lock();
    state.phase = TaskPhase::Idle;
    state.current = None;
    state.queue.clear();
    drop(state);

    tracing::debug!("Task manager actor stopped");
}

async fn run_submission(
    config: &TaskConfig,
    state: &Mutex<TaskState>,
    submission: TaskSubmission,
) {
    let TaskSubmission {
        id,
        name,
        job,
        responder,
    } = submission;

    {
        let mut state = state.lock();
        state.queue.retain(|(queued_id, _)| *queued_id != id);
        state.phase = TaskPhase::Running;
        state.current = Some(RunningTask {
            id,
            name: name.clone(),
            started_at: Utc::now(),
            started: Instant::now(),
        });
    }

    tracing::info!("Task {name} ({id}) started");
    let started = Instant::now();
    // Building the future inside the guard also catches panics in `job` itself
    let guarded = AssertUnwindSafe(async move { job().await }).catch_unwind();
    let outcome = run_with_deadline(guarded, config.task_timeout).await;

    match &outcome {
        TaskOutcome::Completed => {
            tracing::info!("Task {name} completed in {:?}", started.elapsed());
        }
        TaskOutcome::Failed(reason) => tracing::warn!("Task {name} failed: {reason}"),
        TaskOutcome::TimedOut => {
            tracing::warn!("Task {name} timed out after {:?}", config.task_timeout);
        }
    }

    // Cooldown is visible before the submitter learns the outcome
    state.lock().phase = TaskPhase::Cooldown;
    let _ = responder.send(outcome);
}

async fn run_with_deadline<F>(job: F, deadline: Duration) -> TaskOutcome
where
    F: Future<Output = Result<Result<(), String>, Box<dyn Any + Send>>>,
{
    match tokio::time::timeout(deadline, job).await {
        Ok(Ok(Ok(()))) => TaskOutcome::Completed,
        Ok(Ok(Err(reason))) => TaskOutcome::Failed(reason),
        Ok(Err(panic)) => TaskOutcome::Failed(format!("task panicked: {}", panic_message(&*panic))),
        Err(_) => TaskOutcome::TimedOut,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::StrmConfig;

    fn manager() -> TaskManager {
        TaskManager::spawn(StrmConfig::for_testing().tasks)
    }

    fn ok_job() -> impl Future<Output = Result<(), String>> + Send + 'static {
        async { Ok(()) }
    }

    #[tokio::test]
    async fn test_tasks_run_in_submission_order() {
        let manager = manager();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut tickets = Vec::new();
        for name in ["A", "B", "C"] {
            let order = Arc::clone(&order);
            let ticket = manager
                .run_task_with_name(name, move || async move {
                    order.lock().push(name);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok::<_, String>(())
                })
                .unwrap();
            tickets.push(ticket);
        }

        for ticket in tickets {
            assert_eq!(ticket.wait().await.unwrap(), TaskOutcome::Completed);
        }
        assert_eq!(*order.lock(), vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_never_more_than_one_running() {
        let manager = manager();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tickets: Vec<_> = (0..4)
            .map(|i| {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                manager
                    .run_task_with_name(format!("job-{i}"), move || async move {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, String>(())
                    })
                    .unwrap()
            })
            .collect();

        for ticket in tickets {
            ticket.wait().await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_status_reports_running_and_queue() {
        let manager = manager();
        let first = manager
            .run_task_with_name("first", || async {
                tokio::time::sleep(Duration::from_millis(150)).await;
                Ok::<_, String>(())
            })
            .unwrap();
        let second = manager.run_task_with_name("second", ok_job).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let status = manager.status();
        assert!(status.running);
        assert_eq!(status.phase, TaskPhase::Running);
        assert_eq!(status.current_task.as_deref(), Some("first"));
        assert_eq!(status.current_task_id, Some(first.id));
        assert!(status.started_at.is_some());
        assert_eq!(status.queued, vec!["second"]);
        assert_eq!(status.queue_length, 1);

        first.wait().await.unwrap();
        second.wait().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let status = manager.status();
        assert!(!status.running);
        assert_eq!(status.phase, TaskPhase::Idle);
        assert!(status.current_task.is_none());
        assert_eq!(status.queue_length, 0);
    }

    #[tokio::test]
    async fn test_status_lists_queue_in_fifo_order() {
        let manager = manager();
        let t1 = manager
            .run_task_with_name("T1", || async {
                tokio::time::sleep(Duration::from_millis(150)).await;
                Ok::<_, String>(())
            })
            .unwrap();
        let t2 = manager.run_task_with_name("T2", ok_job).unwrap();
        let t3 = manager.run_task_with_name("T3", ok_job).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let status = manager.status();
        assert_eq!(status.current_task.as_deref(), Some("T1"));
        assert_eq!(status.queued, vec!["T2", "T3"]);
        assert_eq!(status.queue_length, 2);

        for ticket in [t1, t2, t3] {
            assert_eq!(ticket.wait().await.unwrap(), TaskOutcome::Completed);
        }
    }

    #[tokio::test]
    async fn test_panicking_task_does_not_stop_manager() {
        let manager = manager();
        let bad = manager
            .run_task_with_name("bad", || async {
                if true {
                    panic!("sync backend crashed");
                }
                Ok::<_, String>(())
            })
            .unwrap();
        let eager = manager
            .run_task_with_name("eager", || -> std::future::Ready<Result<(), String>> {
                panic!("job setup failed")
            })
            .unwrap();
        let good = manager.run_task_with_name("good", ok_job).unwrap();

        assert_eq!(
            bad.wait().await.unwrap(),
            TaskOutcome::Failed("task panicked: sync backend crashed".to_string())
        );
        assert_eq!(
            eager.wait().await.unwrap(),
            TaskOutcome::Failed("task panicked: job setup failed".to_string())
        );
        assert_eq!(good.wait().await.unwrap(), TaskOutcome::Completed);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let status = manager.status();
        assert!(!status.running);
        assert_eq!(status.phase, TaskPhase::Idle);
        assert!(status.current_task.is_none());

        let late = manager.run_task_with_name("late", ok_job).unwrap();
        assert_eq!(late.wait().await.unwrap(), TaskOutcome::Completed);
    }

    #[tokio::test]
    async fn test_cooldown_separates_tasks() {
        let config = TaskConfig {
            cooldown: Duration::from_millis(200),
            ..StrmConfig::for_testing().tasks
        };
        let manager = TaskManager::spawn(config);

        let first = manager.run_task_with_name("first", ok_job).unwrap();
        let second = manager.run_task_with_name("second", ok_job).unwrap();

        first.wait().await.unwrap();
        let finished_first = Instant::now();
        assert_eq!(manager.status().phase, TaskPhase::Cooldown);

        second.wait().await.unwrap();
        assert!(finished_first.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_failure_and_timeout_outcomes() {
        let config = TaskConfig {
            task_timeout: Duration::from_millis(50),
            ..StrmConfig::for_testing().tasks
        };
        let manager = TaskManager::spawn(config);

        let failing = manager
            .run_task_with_name("failing", || async { Err::<(), _>("rclone exited 1") })
            .unwrap();
        let slow = manager
            .run_task_with_name("slow", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, String>(())
            })
            .unwrap();
        let after = manager.run_task_with_name("after", ok_job).unwrap();

        assert_eq!(
            failing.wait().await.unwrap(),
            TaskOutcome::Failed("rclone exited 1".to_string())
        );
        assert_eq!(slow.wait().await.unwrap(), TaskOutcome::TimedOut);
        assert_eq!(after.wait().await.unwrap(), TaskOutcome::Completed);
    }

    #[tokio::test]
    async fn test_shutdown_drops_queued_tasks() {
        let manager = manager();
        let running = manager
            .run_task_with_name("running", || async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<_, String>(())
            })
            .unwrap();
        let queued = manager.run_task_with_name("queued", ok_job).unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.shutdown().await;

        assert_eq!(running.wait().await.unwrap(), TaskOutcome::Completed);
        assert_eq!(queued.wait().await, Err(TaskError::Shutdown));
        assert!(matches!(
            manager.run_task_with_name("late", ok_job),
            Err(TaskError::Shutdown)
        ));
        assert_eq!(manager.status().queue_length, 0);
    }

    #[tokio::test]
    async fn test_queue_full() {
        let config = TaskConfig {
            command_buffer: 1,
            ..StrmConfig::for_testing().tasks
        };
        let manager = TaskManager::spawn(config);
        let _running = manager
            .run_task_with_name("running", || async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, String>(())
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let _queued = manager.run_task_with_name("queued", ok_job).unwrap();
        assert_eq!(
            manager.run_task_with_name("overflow", ok_job).err(),
            Some(TaskError::QueueFull { capacity: 1 })
        );
    }
}
