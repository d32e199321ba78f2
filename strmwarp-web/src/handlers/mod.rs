//! HTTP request handlers organized by functionality

pub mod api;
pub mod error;
pub mod media;
pub mod sync;
pub mod utils;

// Re-export handler functions
pub use api::{clear_cache, service_stats, task_status, verify_api_key};
pub use error::ApiError;
pub use media::{item_detail, playback_info, stream_video};
pub use sync::sync_media;
pub use utils::{query_param, user_agent};
