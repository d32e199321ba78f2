//! Full request flow: client -> strmwarp -> fake media server.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use futures::future::join_all;
use serde_json::{Value, json};
use strmwarp_core::config::MediaSyncServer;
use strmwarp_core::test_mocks::{MockLinkResolver, MockMediaServer, MockSyncBackend};
use strmwarp_core::{ServerComponents, StrmConfig};
use strmwarp_web::{AppState, router};
use tokio::net::TcpListener;

const API_KEY: &str = "integration-key";

/// PlaybackInfo as the media server returns it before rewriting.
async fn upstream_playback_info(
    State(requests): State<Arc<AtomicUsize>>,
    Path(item_id): Path<String>,
) -> Json<Value> {
    requests.fetch_add(1, Ordering::SeqCst);
    Json(json!({
        "MediaSources": [
            {
                "Id": format!("mediasource_{item_id}"),
                "ItemId": item_id,
                "SupportsDirectPlay": false,
                "DirectStreamUrl": format!("/videos/{item_id}/original.mkv?MediaSourceId=mediasource_{item_id}&api_key=client-token"),
                "TranscodingUrl": format!("/videos/{item_id}/master.m3u8"),
                "TranscodingSubProtocol": "hls"
            },
            {
                "Id": "mediasource_5",
                "ItemId": "5",
                "SupportsDirectPlay": false,
                "TranscodingUrl": "/videos/5/master.m3u8"
            }
        ],
        "PlaySessionId": "session"
    }))
}

fn fake_media_server(playback_requests: Arc<AtomicUsize>) -> Router {
    Router::new()
        .route(
            "/emby/Items/{item_id}/PlaybackInfo",
            get(upstream_playback_info).post(upstream_playback_info),
        )
        .route(
            "/emby/Users/{user_id}/Items/{item_id}",
            get(|Path((_, item_id)): Path<(String, String)>| async move {
                Json(json!({ "Id": item_id }))
            }),
        )
        .route(
            "/videos/{item_id}/{name}",
            get(|| async { "local media bytes" }),
        )
        .route("/web/index.html", get(|| async { "web client" }))
        .route("/echo", post(|body: Bytes| async move { body }))
        .with_state(playback_requests)
}

async fn serve(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

struct Harness {
    base: String,
    client: reqwest::Client,
    server: Arc<MockMediaServer>,
    resolver: Arc<MockLinkResolver>,
    components: Arc<ServerComponents>,
    /// PlaybackInfo requests that reached the fake media server
    playback_requests: Arc<AtomicUsize>,
}

async fn harness(resolver: MockLinkResolver) -> Harness {
    let playback_requests = Arc::new(AtomicUsize::new(0));
    let upstream = serve(fake_media_server(Arc::clone(&playback_requests))).await;

    let mut config = StrmConfig::for_testing();
    config.media_server.addr = format!("http://{upstream}");
    config.server.api_key = Some(API_KEY.to_string());
    config.media_sync = vec![MediaSyncServer {
        name: "115".to_string(),
        remote: "115".to_string(),
        local_path: PathBuf::from("/mnt/strm/115"),
    }];

    let server = Arc::new(MockMediaServer::new());
    server.add_strm_item("31", "/mnt/movie.strm", "115://movies/movie.mkv");
    server.add_strm_item("40", "/mnt/clip.strm", "https://media.example/clip.mp4");
    server.add_local_item("5", "/media/local.mkv");
    let resolver = Arc::new(resolver);

    let components = Arc::new(ServerComponents::build(
        config,
        Arc::clone(&server) as Arc<_>,
        Arc::clone(&resolver) as Arc<_>,
        Arc::new(MockSyncBackend::new()),
    ));
    let state = AppState::new(Arc::clone(&components)).unwrap();
    let proxy = serve(router(state)).await;

    Harness {
        base: format!("http://{proxy}"),
        client: reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap(),
        server,
        resolver,
        components,
        playback_requests,
    }
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

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_streams_share_one_resolution() {
    let h = harness(
        MockLinkResolver::new("https://cdn.example/signed?t=1")
            .with_latency(Duration::from_millis(100)),
    )
    .await;

    let url = format!(
        "{}/emby/videos/31/original.mkv?MediaSourceId=mediasource_31&Static=true",
        h.base
    );
    let requests = (0..5).map(|_| {
        h.client
            .get(&url)
            .header("User-Agent", "Infuse/7")
            .send()
    });

    for response in join_all(requests).await {
        let response = response.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::FOUND);
        assert_eq!(
            response.headers()["location"],
            "https://cdn.example/signed?t=1"
        );
    }
    assert_eq!(h.resolver.call_count.load(Ordering::SeqCst), 1);
    assert_eq!(h.resolver.calls()[0].1, "Infuse/7");
}

#[tokio::test]
async fn test_http_strm_and_local_media() {
    let h = harness(MockLinkResolver::new("https://cdn.example/unused")).await;

    let response = h
        .client
        .get(format!("{}/Videos/40/stream?MediaSourceId=mediasource_40", h.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::FOUND);
    assert_eq!(
        response.headers()["location"],
        "https://media.example/clip.mp4"
    );

    let response = h
        .client
        .get(format!("{}/videos/5/stream.mkv?MediaSourceId=mediasource_5", h.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "local media bytes");
    assert_eq!(h.resolver.call_count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_playback_info_forces_direct_play() {
    let h = harness(MockLinkResolver::new("https://cdn.example/signed")).await;

    let response = h
        .client
        .post(format!(
            "{}/emby/Items/31/PlaybackInfo?UserId=u1&api_key=client-token",
            h.base
        ))
        .json(&json!({ "DeviceProfile": {} }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let body: Value = response.json().await.unwrap();
    let strm = &body["MediaSources"][0];
    assert_eq!(strm["SupportsDirectPlay"], true);
    assert_eq!(strm["SupportsDirectStream"], true);
    assert!(strm.get("TranscodingUrl").is_none());
    assert_eq!(
        strm["DirectStreamUrl"],
        "/videos/31/stream?MediaSourceId=mediasource_31&Static=true&api_key=client-token"
    );

    let local = &body["MediaSources"][1];
    assert_eq!(local["SupportsDirectPlay"], false);
    assert_eq!(local["TranscodingUrl"], "/videos/5/master.m3u8");
    assert_eq!(body["PlaySessionId"], "session");

    assert_eq!(h.playback_requests.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_repeated_playback_info_is_served_from_cache() {
    let h = harness(MockLinkResolver::new("https://cdn.example/signed")).await;
    let url = |token: &str| {
        format!("{}/emby/Items/31/PlaybackInfo?UserId=u1&api_key={token}", h.base)
    };

    let response = h.client.get(url("client-token")).send().await.unwrap();
    let first: Value = response.json().await.unwrap();
    let response = h.client.get(url("client-token")).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert!(
        response.headers()[reqwest::header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .contains("json")
    );
    let second: Value = response.json().await.unwrap();

    assert_eq!(first, second);
    assert_eq!(second["MediaSources"][0]["SupportsDirectPlay"], true);
    assert_eq!(h.playback_requests.load(Ordering::SeqCst), 1);
    assert_eq!(h.components.cache.stats().playback.hits, 1);

    // Another client's token is a different request
    h.client.get(url("other-token")).send().await.unwrap();
    assert_eq!(h.playback_requests.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_item_detail_preloads_redirect() {
    let h = harness(MockLinkResolver::new("https://cdn.example/preloaded")).await;

    let response = h
        .client
        .get(format!("{}/emby/Users/u1/Items/31", h.base))
        .header("User-Agent", "VLC")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.json::<Value>().await.unwrap()["Id"], "31");

    let resolver = Arc::clone(&h.resolver);
    assert!(eventually(|| resolver.call_count.load(Ordering::SeqCst) == 1).await);

    let response = h
        .client
        .get(format!("{}/videos/31/stream?MediaSourceId=mediasource_31", h.base))
        .header("User-Agent", "VLC")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::FOUND);
    assert_eq!(
        response.headers()["location"],
        "https://cdn.example/preloaded"
    );
    assert_eq!(h.resolver.call_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_sync_trigger_over_http() {
    let h = harness(MockLinkResolver::new("https://cdn.example/x")).await;
    let url = format!("{}/Sync/movies/2024", h.base);

    let response = h.client.post(&url).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);

    let response = h
        .client
        .post(&url)
        .header("X-API-Key", API_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);
    let accepted: Value = response.json().await.unwrap();
    assert_eq!(accepted["source"], "115:movies/2024");
    assert_eq!(accepted["target"], "/mnt/strm/115/movies/2024");
    assert!(accepted["task_id"].as_str().is_some_and(|id| !id.is_empty()));

    let server = Arc::clone(&h.server);
    assert!(eventually(|| server.scan_count.load(Ordering::SeqCst) == 1).await);

    let status: Value = h
        .client
        .get(format!("{}/api/tasks/status", h.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(status["queue_length"].as_u64().is_some());
}

#[tokio::test]
async fn test_unmatched_requests_pass_through() {
    let h = harness(MockLinkResolver::new("https://cdn.example/x")).await;

    let response = h
        .client
        .get(format!("{}/web/index.html", h.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "web client");

    let response = h
        .client
        .post(format!("{}/echo", h.base))
        .body("played to the end")
        .send()
        .await
        .unwrap();
    assert_eq!(response.text().await.unwrap(), "played to the end");

    let response = h
        .client
        .get(format!("{}/missing", h.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}
