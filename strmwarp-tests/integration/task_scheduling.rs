//! Task manager behavior under concurrent submission.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use strmwarp_core::TaskManager;
use strmwarp_core::config::TaskConfig;
use strmwarp_core::tasks::{TaskError, TaskOutcome, TaskPhase};
use tokio::time::Instant;

fn manager(cooldown: Duration, task_timeout: Duration) -> TaskManager {
    TaskManager::spawn(TaskConfig {
        cooldown,
        task_timeout,
        ..Default::default()
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tasks_run_one_at_a_time_in_submission_order() {
    let manager = manager(Duration::from_millis(10), Duration::from_secs(2));
    let order = Arc::new(Mutex::new(Vec::new()));
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut tickets = Vec::new();
    for i in 0..5 {
        let order = Arc::clone(&order);
        let active = Arc::clone(&active);
        let peak = Arc::clone(&peak);
        let ticket = manager
            .run_task_with_name(format!("job {i}"), move || async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(60)).await;
                order.lock().unwrap().push(i);
                active.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .unwrap();
        tickets.push(ticket);
    }

    // While the first job runs the rest wait in submission order
    tokio::time::sleep(Duration::from_millis(20)).await;
    let status = manager.status();
    assert_eq!(status.current_task.as_deref(), Some("job 0"));
    assert_eq!(status.queued, vec!["job 1", "job 2", "job 3", "job 4"]);
    assert_eq!(status.queue_length, 4);

    for ticket in tickets {
        assert_eq!(ticket.wait().await.unwrap(), TaskOutcome::Completed);
    }
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    assert_eq!(peak.load(Ordering::SeqCst), 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_cooldown_separates_tasks() {
    let cooldown = Duration::from_millis(150);
    let manager = manager(cooldown, Duration::from_secs(2));
    let starts = Arc::new(Mutex::new(Vec::new()));

    let mut tickets = Vec::new();
    for name in ["first", "second"] {
        let starts = Arc::clone(&starts);
        tickets.push(
            manager
                .run_task_with_name(name, move || async move {
                    starts.lock().unwrap().push(Instant::now());
                    Ok::<_, String>(())
                })
                .unwrap(),
        );
    }

    let mut tickets = tickets.into_iter();
    let first = tickets.next().unwrap();
    assert_eq!(first.wait().await.unwrap(), TaskOutcome::Completed);

    let status = manager.status();
    assert_eq!(status.phase, TaskPhase::Cooldown);
    assert!(status.running);
    assert_eq!(status.current_task.as_deref(), Some("first"));

    let second = tickets.next().unwrap();
    assert_eq!(second.wait().await.unwrap(), TaskOutcome::Completed);

    let starts = starts.lock().unwrap().clone();
    assert_eq!(starts.len(), 2);
    assert!(starts[1] - starts[0] >= cooldown);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_failed_and_timed_out_tasks_release_the_slot() {
    let manager = manager(Duration::from_millis(10), Duration::from_millis(100));

    let failing = manager
        .run_task_with_name("failing", || async { Err::<(), _>("rclone exited with 1") })
        .unwrap();
    let hanging = manager
        .run_task_with_name("hanging", || async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, String>(())
        })
        .unwrap();
    let healthy = manager
        .run_task_with_name("healthy", || async { Ok::<_, String>(()) })
        .unwrap();

    assert_eq!(
        failing.wait().await.unwrap(),
        TaskOutcome::Failed("rclone exited with 1".to_string())
    );
    assert_eq!(hanging.wait().await.unwrap(), TaskOutcome::TimedOut);
    assert_eq!(healthy.wait().await.unwrap(), TaskOutcome::Completed);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_rejects_new_tasks() {
    let manager = manager(Duration::from_millis(10), Duration::from_secs(1));
    manager.shutdown().await;

    let result = manager.run_task_with_name("late", || async { Ok::<_, String>(()) });
    assert!(matches!(result, Err(TaskError::Shutdown)));
    assert!(!manager.status().running);
}
