//! Sync then rescan workflow through the shared task manager.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use strmwarp_core::config::{MediaSyncServer, SyncSchedule};
use strmwarp_core::tasks::TaskOutcome;
use strmwarp_core::test_mocks::{MockLinkResolver, MockMediaServer, MockSyncBackend};
use strmwarp_core::{ServerComponents, StrmConfig, SyncError};

struct Fixture {
    server: Arc<MockMediaServer>,
    backend: Arc<MockSyncBackend>,
    components: ServerComponents,
}

fn config() -> StrmConfig {
    let mut config = StrmConfig::for_testing();
    config.media_sync = vec![
        MediaSyncServer {
            name: "115".to_string(),
            remote: "115:".to_string(),
            local_path: PathBuf::from("/mnt/strm/115"),
        },
        MediaSyncServer {
            name: "od".to_string(),
            remote: "onedrive".to_string(),
            local_path: PathBuf::from("/mnt/strm/od"),
        },
    ];
    config
}

fn fixture_with(config: StrmConfig, server: MockMediaServer, backend: MockSyncBackend) -> Fixture {
    let server = Arc::new(server);
    let backend = Arc::new(backend);
    let components = ServerComponents::build(
        config,
        Arc::clone(&server) as Arc<_>,
        Arc::new(MockLinkResolver::new("https://cdn.example/x")),
        Arc::clone(&backend) as Arc<_>,
    );
    Fixture {
        server,
        backend,
        components,
    }
}

fn fixture() -> Fixture {
    fixture_with(config(), MockMediaServer::new(), MockSyncBackend::new())
}

async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn test_manual_sync_runs_then_rescans() {
    let f = fixture();

    let ticket = f
        .components
        .sync
        .trigger_for_server(None, "/movies/2024", None)
        .unwrap();
    assert_eq!(ticket.name, "sync 115:movies/2024");
    assert_eq!(ticket.wait().await.unwrap(), TaskOutcome::Completed);

    let requests = f.backend.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].source, "115:movies/2024");
    assert_eq!(requests[0].target, PathBuf::from("/mnt/strm/115/movies/2024"));
    assert_eq!(f.server.scan_count.load(Ordering::SeqCst), 1);

    f.components.shutdown().await;
}

#[tokio::test]
async fn test_named_server_and_target_root() {
    let f = fixture();

    let ticket = f
        .components
        .sync
        .trigger_for_server(Some("od"), "shows", Some(Path::new("/srv/strm")))
        .unwrap();
    assert_eq!(ticket.wait().await.unwrap(), TaskOutcome::Completed);

    let request = f.backend.requests()[0].clone();
    assert_eq!(request.source, "onedrive:shows");
    assert_eq!(request.target, PathBuf::from("/srv/strm/shows"));

    let unknown = f.components.sync.trigger_for_server(Some("gd"), "shows", None);
    assert!(matches!(unknown, Err(SyncError::UnknownServer { .. })));

    f.components.shutdown().await;
}

#[tokio::test]
async fn test_failed_sync_skips_rescan() {
    let f = fixture_with(config(), MockMediaServer::new(), MockSyncBackend::new_with_failure());

    let ticket = f.components.sync.trigger_for_server(None, "movies", None).unwrap();
    match ticket.wait().await.unwrap() {
        TaskOutcome::Failed(reason) => assert!(reason.contains("mock sync failure")),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(f.server.scan_count.load(Ordering::SeqCst), 0);

    f.components.shutdown().await;
}

#[tokio::test]
async fn test_rescan_failure_fails_the_task() {
    let f = fixture_with(
        config(),
        MockMediaServer::new_with_scan_failure(),
        MockSyncBackend::new(),
    );

    let ticket = f.components.sync.trigger_for_server(None, "movies", None).unwrap();
    assert!(matches!(ticket.wait().await.unwrap(), TaskOutcome::Failed(_)));
    assert_eq!(f.backend.call_count.load(Ordering::SeqCst), 1);
    assert_eq!(f.server.scan_count.load(Ordering::SeqCst), 1);

    f.components.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_triggers_are_serialized() {
    let f = fixture_with(
        config(),
        MockMediaServer::new(),
        MockSyncBackend::new().with_latency(Duration::from_millis(30)),
    );

    let tickets: Vec<_> = ["a", "b", "c"]
        .into_iter()
        .map(|path| f.components.sync.trigger_for_server(None, path, None).unwrap())
        .collect();

    let status = f.components.tasks.status();
    assert!(status.running || status.queue_length == 3);

    for ticket in tickets {
        assert_eq!(ticket.wait().await.unwrap(), TaskOutcome::Completed);
    }

    let sources: Vec<_> = f
        .backend
        .requests()
        .into_iter()
        .map(|request| request.source)
        .collect();
    assert_eq!(sources, vec!["115:a", "115:b", "115:c"]);
    assert_eq!(f.server.scan_count.load(Ordering::SeqCst), 3);

    f.components.shutdown().await;
}

#[tokio::test]
async fn test_schedules_resubmit_through_task_manager() {
    let mut config = config();
    config.schedules = vec![
        SyncSchedule {
            name: "nightly movies".to_string(),
            server: "115".to_string(),
            path: "movies".to_string(),
            interval: Duration::from_millis(40),
        },
        SyncSchedule {
            name: "broken".to_string(),
            server: "missing".to_string(),
            path: "movies".to_string(),
            interval: Duration::from_millis(40),
        },
    ];
    let f = fixture_with(config, MockMediaServer::new(), MockSyncBackend::new());

    f.components.start_background();
    let backend = Arc::clone(&f.backend);
    assert!(eventually(|| backend.call_count.load(Ordering::SeqCst) >= 2).await);
    assert!(
        f.backend
            .requests()
            .iter()
            .all(|request| request.source == "115:movies")
    );

    f.components.shutdown().await;
}
