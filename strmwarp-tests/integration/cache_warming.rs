//! Cache warming wired into stream resolution.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use strmwarp_core::test_mocks::{MockLinkResolver, MockMediaServer, MockSyncBackend};
use strmwarp_core::{Resolution, ServerComponents, StrmConfig};

fn components(config: StrmConfig, server: &Arc<MockMediaServer>) -> ServerComponents {
    ServerComponents::build(
        config,
        Arc::clone(server) as Arc<_>,
        Arc::new(MockLinkResolver::new("https://cdn.example/signed")),
        Arc::new(MockSyncBackend::new()),
    )
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
async fn test_startup_warmup_fills_popular_items() {
    let server = Arc::new(MockMediaServer::new());
    server.add_strm_item("10", "/mnt/a.strm", "115://a.mkv");
    server.add_local_item("11", "/media/b.mkv");

    let mut config = StrmConfig::for_testing();
    config.warmup.popular_items = vec!["10".to_string(), "11".to_string(), "404".to_string()];
    let components = components(config, &server);

    let report = components.start_background().await.unwrap();
    assert_eq!(report.filled, 2);
    assert_eq!(report.failed, 1);

    let queries = server.query_count.load(Ordering::SeqCst);
    let resolution = components
        .engine
        .resolve("mediasource_10", "/videos/10/stream", "VLC")
        .await;
    assert!(matches!(resolution, Resolution::Redirect(_)));
    // Served from the warmed item cache
    assert_eq!(server.query_count.load(Ordering::SeqCst), queries);

    components.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_playback_warms_following_items() {
    let server = Arc::new(MockMediaServer::new());
    for id in ["31", "32", "33"] {
        server.add_strm_item(id, &format!("/mnt/e{id}.strm"), &format!("115://show/e{id}.mkv"));
    }
    let components = components(StrmConfig::for_testing(), &server);

    let resolution = components
        .engine
        .resolve("mediasource_31", "/videos/31/stream", "VLC")
        .await;
    assert!(matches!(resolution, Resolution::Redirect(_)));
    assert_eq!(components.warmer.recent_items(), vec!["31"]);

    let cache = Arc::clone(&components.cache);
    assert!(eventually(|| cache.get_item("32").is_some() && cache.get_item("33").is_some()).await);

    let queries = server.query_count.load(Ordering::SeqCst);
    components
        .engine
        .resolve("mediasource_32", "/videos/32/stream", "VLC")
        .await;
    assert_eq!(server.query_count.load(Ordering::SeqCst), queries);

    let stats = components.stats();
    assert!(stats.warmer.successful_warmups >= 2);

    components.shutdown().await;
}

#[tokio::test]
async fn test_upstream_outage_passes_streams_through() {
    let server = Arc::new(MockMediaServer::new_with_query_failure());
    let components = components(StrmConfig::for_testing(), &server);

    let resolution = components
        .engine
        .resolve("mediasource_31", "/videos/31/stream", "VLC")
        .await;
    assert_eq!(resolution, Resolution::Pass);
    assert!(components.warmer.recent_items().is_empty());

    components.shutdown().await;
}
