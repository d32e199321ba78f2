//! Serialized background jobs and the media sync service built on them.

mod manager;
mod sync;

pub use manager::{TaskError, TaskManager, TaskOutcome, TaskPhase, TaskStatus, TaskTicket};
pub use sync::{MediaSyncBackend, RcloneSyncBackend, SyncError, SyncSource, SyncService};
