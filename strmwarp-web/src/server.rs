//! Reverse proxy server for Strmwarp
//!
//! Intercepts stream, PlaybackInfo and item detail routes of the media
//! server, exposes the sync trigger and JSON API, and forwards every
//! other request upstream.

use std::sync::Arc;

use axum::Router;
use axum::extract::{Request, State};
use axum::response::Response;
use axum::routing::{get, post};
use strmwarp_core::config::StrmConfig;
use strmwarp_core::{ServerComponents, UpstreamError};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{
    clear_cache, item_detail, playback_info, service_stats, stream_video, sync_media, task_status,
    verify_api_key,
};
use crate::proxy::{ProxyError, ReverseProxy};

/// Errors that prevent the server from starting or serving.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to initialize services: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("Failed to initialize proxy: {0}")]
    Proxy(#[from] ProxyError),

    #[error("Server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared state for every handler.
#[derive(Clone)]
pub struct AppState {
    pub components: Arc<ServerComponents>,
    pub proxy: ReverseProxy,
    /// Key required by the sync trigger and cache control routes
    pub api_key: Option<String>,
}

impl AppState {
    /// Builds state proxying to the configured media server.
    ///
    /// # Errors
    ///
    /// - `ProxyError::InvalidUpstream` - The media server address is not a URL
    pub fn new(components: Arc<ServerComponents>) -> Result<Self, ProxyError> {
        let config = &components.config;
        let proxy = ReverseProxy::new(&config.media_server.addr, config.media_server.request_timeout)?;
        let api_key = config.server.api_key.clone();
        Ok(Self {
            components,
            proxy,
            api_key,
        })
    }
}

/// Routes intercepted from the media server, mounted with and without
/// the `/emby` prefix.
fn media_routes() -> Router<AppState> {
    Router::new()
        .route("/videos/{item_id}/{name}", get(stream_video))
        .route("/Videos/{item_id}/{name}", get(stream_video))
        .route(
            "/Items/{item_id}/PlaybackInfo",
            get(playback_info).post(playback_info),
        )
        .route("/Users/{user_id}/Items/{item_id}", get(item_detail))
}

async fn fallback(State(state): State<AppState>, request: Request) -> Response {
    state.proxy.forward(request).await
}

/// Builds the application router.
pub fn router(state: AppState) -> Router {
    let media = media_routes();

    Router::new()
        .merge(media.clone())
        .nest("/emby", media)
        // Sync and management API
        .route("/Sync/{*path}", post(sync_media))
        .route("/api/tasks/status", get(task_status))
        .route("/api/stats", get(service_stats))
        .route("/api/cache/clear", post(clear_cache))
        .route("/api/verify", post(verify_api_key))
        // Everything else goes upstream untouched
        .fallback(fallback)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

/// Runs the proxy until Ctrl-C, then drains services.
///
/// # Errors
///
/// - `ServerError::Upstream` - The media server client could not be built
/// - `ServerError::Proxy` - The media server address is invalid
/// - `ServerError::Io` - Binding or serving failed
pub async fn run_server(config: StrmConfig) -> Result<(), ServerError> {
    let listen_addr = config.server.listen_addr;
    let upstream_addr = config.media_server.addr.clone();
    let sync_enabled = config.server.api_key.is_some();

    let components = Arc::new(ServerComponents::from_config(config)?);
    let state = AppState::new(Arc::clone(&components))?;

    // Warm-up runs in the background; serving starts immediately
    let warmup = components.start_background();
    tokio::spawn(async move {
        if let Ok(report) = warmup.await {
            tracing::info!(
                "Startup warm-up done: {} filled, {} cached, {} failed",
                report.filled,
                report.already_cached,
                report.failed
            );
        }
    });

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    tracing::info!("Strmwarp listening on http://{listen_addr}, proxying {upstream_addr}");
    if !sync_enabled {
        tracing::warn!("No API key configured, sync and cache control endpoints are disabled");
    }

    let result = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    components.shutdown().await;
    result.map_err(ServerError::from)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Method, StatusCode, header};
    use strmwarp_core::test_mocks::{MockLinkResolver, MockMediaServer, MockSyncBackend};
    use tower::ServiceExt;

    use super::*;

    /// Port 9 (discard) is closed, so forwarded requests fail fast.
    const UNREACHABLE_UPSTREAM: &str = "http://127.0.0.1:9";

    struct Fixture {
        server: Arc<MockMediaServer>,
        resolver: Arc<MockLinkResolver>,
        state: AppState,
    }

    fn fixture(api_key: Option<&str>) -> Fixture {
        let server = Arc::new(MockMediaServer::new());
        server.add_strm_item("31", "/mnt/movie.strm", "115://movies/movie.mkv");
        server.add_local_item("5", "/media/local.mkv");
        let resolver = Arc::new(MockLinkResolver::new("https://cdn.example/signed"));

        let mut config = StrmConfig::for_testing();
        config.server.api_key = api_key.map(str::to_string);
        let components = Arc::new(ServerComponents::build(
            config,
            Arc::clone(&server) as Arc<_>,
            Arc::clone(&resolver) as Arc<_>,
            Arc::new(MockSyncBackend::new()),
        ));
        let state = AppState {
            proxy: ReverseProxy::new(UNREACHABLE_UPSTREAM, Duration::from_millis(200)).unwrap(),
            api_key: api_key.map(str::to_string),
            components,
        };
        Fixture {
            server,
            resolver,
            state,
        }
    }

    fn request(method: Method, uri: &str) -> Request {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::USER_AGENT, "VLC")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_strm_stream_redirects() {
        let f = fixture(None);
        let app = router(f.state.clone());

        for uri in [
            "/videos/31/stream.mkv?MediaSourceId=mediasource_31&Static=true",
            "/emby/Videos/31/original.mkv",
        ] {
            let response = app.clone().oneshot(request(Method::GET, uri)).await.unwrap();
            assert_eq!(response.status(), StatusCode::FOUND, "{uri}");
            assert_eq!(
                response.headers()[header::LOCATION],
                "https://cdn.example/signed"
            );
        }
        // Second request served from the redirect cache
        assert_eq!(f.resolver.call_count.load(Ordering::SeqCst), 1);
        assert_eq!(f.resolver.calls()[0].1, "VLC");
    }

    #[tokio::test]
    async fn test_local_and_head_requests_are_forwarded() {
        let f = fixture(None);
        let app = router(f.state.clone());

        let response = app
            .clone()
            .oneshot(request(Method::GET, "/videos/5/stream.mkv?MediaSourceId=mediasource_5"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let response = app
            .oneshot(request(Method::HEAD, "/videos/31/stream.mkv?MediaSourceId=mediasource_31"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(f.resolver.call_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_routes_fall_back_to_proxy() {
        let f = fixture(None);
        let response = router(f.state)
            .oneshot(request(Method::GET, "/web/index.html"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_sync_requires_api_key() {
        let f = fixture(None);
        let response = router(f.state)
            .oneshot(request(Method::POST, "/Sync/movies"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let f = fixture(Some("secret"));
        let app = router(f.state);
        let response = app
            .clone()
            .oneshot(request(Method::POST, "/Sync/movies"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // Valid key but no media sync servers configured
        let mut sync = request(Method::POST, "/Sync/movies");
        sync.headers_mut()
            .insert("X-API-Key", "secret".parse().unwrap());
        let response = app.oneshot(sync).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_task_status_route() {
        let f = fixture(None);
        let response = router(f.state)
            .oneshot(request(Method::GET, "/api/tasks/status"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let status: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(status["running"], false);
        assert_eq!(status["queue_length"], 0);
        assert_eq!(f.server.scan_count.load(Ordering::SeqCst), 0);
    }
}
