//! Error responses for the JSON API.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use strmwarp_core::{StrmError, SyncError, TaskError};

/// Errors returned by API handlers as JSON bodies.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Unauthorized: invalid API key")]
    Unauthorized,

    #[error("Sync API is disabled: no API key configured")]
    Disabled,

    #[error(transparent)]
    Core(#[from] StrmError),
}

impl From<SyncError> for ApiError {
    fn from(error: SyncError) -> Self {
        ApiError::Core(StrmError::Sync(error))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            ApiError::Disabled => (StatusCode::FORBIDDEN, self.to_string()),
            ApiError::Core(error) => {
                let status = match error {
                    e if e.is_user_error() => StatusCode::BAD_REQUEST,
                    StrmError::Task(TaskError::QueueFull { .. })
                    | StrmError::Sync(SyncError::Task(TaskError::QueueFull { .. })) => {
                        StatusCode::TOO_MANY_REQUESTS
                    }
                    StrmError::Task(TaskError::Shutdown)
                    | StrmError::Sync(SyncError::Task(TaskError::Shutdown)) => {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                tracing::warn!("API error: {error}");
                (status, error.user_message())
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
