//! JSON API for observability and cache control.

use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use serde_json::{Value, json};
use strmwarp_core::ServiceStats;
use strmwarp_core::tasks::TaskStatus;

use super::error::ApiError;
use super::sync::authorize;
use crate::server::AppState;

/// `GET /api/tasks/status`
pub async fn task_status(State(state): State<AppState>) -> Json<TaskStatus> {
    Json(state.components.tasks.status())
}

/// `GET /api/stats`
pub async fn service_stats(State(state): State<AppState>) -> Json<ServiceStats> {
    Json(state.components.stats())
}

/// `POST /api/cache/clear`: drop every cached item, classification,
/// redirect and PlaybackInfo response.
///
/// # Errors
///
/// - `ApiError::Unauthorized` / `Disabled` - API key check failed
pub async fn clear_cache(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    authorize(&state, &headers)?;
    let before = state.components.cache.stats().total.entries;
    state.components.cache.clear();
    tracing::info!("Cleared {before} cache entries");
    Ok(Json(json!({ "cleared": before })))
}

/// `POST /api/verify`: check an API key.
///
/// # Errors
///
/// - `ApiError::Unauthorized` / `Disabled` - API key check failed
pub async fn verify_api_key(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    authorize(&state, &headers)?;
    Ok(Json(json!({ "message": "API key is valid" })))
}
