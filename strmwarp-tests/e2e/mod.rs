//! End-to-end tests for Strmwarp
//!
//! These tests run the proxy on a real socket in front of a fake media
//! server and drive it with an HTTP client, covering redirects,
//! PlaybackInfo rewriting, preloading, sync triggers and pass-through.

mod proxy_workflow;
