//! Media routes intercepted in front of the upstream server.

use axum::body::Bytes;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use strmwarp_core::strm::PreloadOutcome;
use strmwarp_core::Resolution;

use super::utils::{playback_cache_id, query_param, user_agent};
use crate::proxy::{ProxyError, buffered_response, streaming_response};
use crate::server::AppState;

/// Largest PlaybackInfo request body read before forwarding.
const MAX_PLAYBACK_REQUEST_BYTES: usize = 1024 * 1024;

/// Stream request: redirect strm media to its resolved URL, forward
/// everything else.
///
/// HEAD requests are always forwarded so probing clients never trigger a
/// link resolution.
pub async fn stream_video(State(state): State<AppState>, request: Request) -> Response {
    if request.method() == Method::HEAD {
        return state.proxy.forward(request).await;
    }

    let media_source_id = query_param(request.uri(), "MediaSourceId").unwrap_or_default();
    let user_agent = user_agent(request.headers());
    let resolution = state
        .components
        .engine
        .resolve(&media_source_id, request.uri().path(), &user_agent)
        .await;

    match resolution {
        Resolution::Redirect(url) => match HeaderValue::from_str(&url) {
            Ok(location) => (StatusCode::FOUND, [(header::LOCATION, location)]).into_response(),
            Err(_) => {
                tracing::warn!("Resolved URL is not a valid header value, forwarding: {url}");
                state.proxy.forward(request).await
            }
        },
        Resolution::Pass => state.proxy.forward(request).await,
    }
}

/// PlaybackInfo: serve the rewritten body cached for an identical request,
/// otherwise forward and force direct play for strm sources.
///
/// Non-JSON or unsuccessful upstream responses are relayed unchanged and
/// never cached.
pub async fn playback_info(
    State(state): State<AppState>,
    Path(item_id): Path<String>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, MAX_PLAYBACK_REQUEST_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!("Failed to read PlaybackInfo request body: {e}");
            return StatusCode::PAYLOAD_TOO_LARGE.into_response();
        }
    };

    let cache_id = playback_cache_id(&item_id, &parts.uri, &parts.headers, &body);
    if let Some(playback) = state.components.engine.cached_playback(&cache_id) {
        match serde_json::to_vec(playback.body()) {
            Ok(cached) => {
                tracing::debug!("Serving cached PlaybackInfo for {item_id}");
                return (
                    [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
                    cached,
                )
                    .into_response();
            }
            Err(e) => tracing::warn!("Cached PlaybackInfo for {item_id} is unusable: {e}"),
        }
    }

    let mut headers = parts.headers;
    // The body is rewritten, so it must arrive uncompressed
    headers.remove(header::ACCEPT_ENCODING);

    let upstream = match state
        .proxy
        .send_buffered(parts.method, &parts.uri, headers, body)
        .await
    {
        Ok(upstream) => upstream,
        Err(e) => return e.into_response(),
    };

    let is_json = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.contains("json"));
    if !upstream.status().is_success() || !is_json {
        return streaming_response(upstream).unwrap_or_else(ProxyError::into_response);
    }

    let status = upstream.status();
    let headers = upstream.headers().clone();
    let raw = match upstream.bytes().await {
        Ok(raw) => raw,
        Err(e) => return ProxyError::from(e).into_response(),
    };

    let Ok(document) = serde_json::from_slice::<serde_json::Value>(&raw) else {
        tracing::warn!("PlaybackInfo for {item_id} is not valid JSON, relaying unchanged");
        return buffered_response(status, headers, raw);
    };

    let playback = state
        .components
        .engine
        .rewrite_playback(&item_id, &cache_id, document)
        .await;
    match serde_json::to_vec(playback.body()) {
        Ok(rewritten) => buffered_response(status, headers, Bytes::from(rewritten)),
        Err(e) => {
            tracing::warn!("Failed to encode rewritten PlaybackInfo for {item_id}: {e}");
            buffered_response(status, headers, raw)
        }
    }
}

/// Item detail: forward, and preload the redirect for strm items in the
/// background so the following stream request hits the cache.
pub async fn item_detail(
    State(state): State<AppState>,
    Path((_user_id, item_id)): Path<(String, String)>,
    request: Request,
) -> Response {
    let user_agent = user_agent(request.headers());
    let engine = std::sync::Arc::clone(&state.components.engine);

    tokio::spawn(async move {
        match engine.preload(&item_id, &user_agent).await {
            PreloadOutcome::Stored => tracing::debug!("Preloaded redirect for {item_id}"),
            PreloadOutcome::Failed(reason) => {
                tracing::debug!("Preload for {item_id} failed: {reason}");
            }
            PreloadOutcome::AlreadyCached | PreloadOutcome::NotApplicable => {}
        }
    });

    state.proxy.forward(request).await
}
