//! Strmwarp Web - reverse proxy in front of Emby and Jellyfin

#![warn(clippy::missing_errors_doc)]
#![deny(clippy::missing_panics_doc)]
#![warn(clippy::too_many_lines)]
//!
//! Redirects strm playback to resolved download URLs, rewrites
//! PlaybackInfo for direct play and forwards everything else upstream.

pub mod handlers;
pub mod proxy;
pub mod server;

// Re-export main types
pub use proxy::{ProxyError, ReverseProxy};
pub use server::{AppState, ServerError, router, run_server};
