//! Manual sync trigger.

use std::path::Path as FsPath;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use serde::Serialize;

use super::error::ApiError;
use super::utils::header_value;
use crate::server::AppState;

/// Header naming the configured media sync server; defaults to the first.
pub const SYNC_SERVER_HEADER: &str = "X-Sync-Server";
/// Header overriding the local target root; defaults to the server's path.
pub const TARGET_ROOT_HEADER: &str = "X-Target-Root";
pub const API_KEY_HEADER: &str = "X-API-Key";

/// Response for an accepted sync.
#[derive(Debug, Serialize)]
pub struct SyncAccepted {
    pub task_id: String,
    pub name: String,
    pub source: String,
    pub target: String,
    pub queue_length: usize,
}

/// Checks `X-API-Key` against the configured key.
///
/// # Errors
///
/// - `ApiError::Disabled` - No API key is configured
/// - `ApiError::Unauthorized` - The header is missing or wrong
pub fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.api_key.as_deref() else {
        return Err(ApiError::Disabled);
    };
    match header_value(headers, API_KEY_HEADER) {
        Some(provided) if provided == expected => Ok(()),
        _ => Err(ApiError::Unauthorized),
    }
}

/// `POST /Sync/{*path}`: queue a sync of `path` followed by a library scan.
///
/// # Errors
///
/// - `ApiError::Unauthorized` / `Disabled` - API key check failed
/// - `ApiError::Core` - Unknown server, invalid request or full queue
pub async fn sync_media(
    State(state): State<AppState>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<SyncAccepted>), ApiError> {
    authorize(&state, &headers)?;

    let server = header_value(&headers, SYNC_SERVER_HEADER);
    let target_root = header_value(&headers, TARGET_ROOT_HEADER).map(FsPath::new);

    let sync = &state.components.sync;
    let request = sync.request_for(server, &path, target_root)?;
    let source = request.source.clone();
    let target = request.target.display().to_string();
    let ticket = sync.run_sync_task(format!("sync {source}"), request)?;

    tracing::info!("Sync of {source} into {target} queued as {}", ticket.id);
    Ok((
        StatusCode::ACCEPTED,
        Json(SyncAccepted {
            task_id: ticket.id.to_string(),
            name: ticket.name,
            source,
            target,
            queue_length: sync.tasks().status().queue_length,
        }),
    ))
}
