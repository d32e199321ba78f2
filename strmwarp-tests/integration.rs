//! Integration tests for Strmwarp
//!
//! These tests wire real services together through `ServerComponents`
//! with mock collaborators standing in for the media server and rclone.
//! They cover task serialization, the sync workflow and cache warming.

#[path = "style.rs"]
mod style;

#[path = "integration/cache_warming.rs"]
mod cache_warming;
#[path = "integration/sync_workflow.rs"]
mod sync_workflow;
#[path = "integration/task_scheduling.rs"]
mod task_scheduling;
