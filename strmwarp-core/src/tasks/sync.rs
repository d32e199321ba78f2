//! Media sync jobs: mirror a remote tree into local strm files, then
//! rescan the media server library.
//!
//! Every sync, whether manual, scheduled or ad hoc, is submitted to the
//! shared [`TaskManager`].

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::manager::{TaskError, TaskManager, TaskTicket};
use crate::config::{MediaSyncServer, ResolverConfig, SyncSchedule, TaskConfig};
use crate::remote::rclone::{CommandError, run_rclone};
use crate::upstream::{MediaServerClient, UpstreamError};

/// Options accepted without a `key=value` form.
const BARE_OPTIONS: [&str; 2] = ["strm-format", "sync-delete"];

/// Errors from preparing or running a sync.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("Invalid sync request: {reason}")]
    InvalidRequest { reason: String },

    #[error("No media sync server configured")]
    NoServersConfigured,

    #[error("Unknown media sync server: {name}")]
    UnknownServer { name: String },

    #[error("Sync of {source_path} failed: {reason}")]
    CommandFailed { source_path: String, reason: String },

    #[error("Sync of {source_path} timed out after {after:?}")]
    Timeout { source_path: String, after: Duration },

    #[error("Library scan failed: {0}")]
    Scan(#[from] UpstreamError),

    #[error("Task submission failed: {0}")]
    Task(#[from] TaskError),
}

/// One `rclone backend media-sync` invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncSource {
    /// `remote:path` to read from
    pub source: String,
    /// Absolute local directory to write strm files into
    pub target: PathBuf,
    pub options: Vec<String>,
}

impl SyncSource {
    /// Checks the request before anything is spawned.
    ///
    /// # Errors
    ///
    /// - `SyncError::InvalidRequest` - Empty or malformed source, relative
    ///   target, a `..` segment in either path, or an option that is
    ///   neither `key=value`, a flag, nor a known bare option
    pub fn validate(&self) -> Result<(), SyncError> {
        let invalid = |reason: String| Err(SyncError::InvalidRequest { reason });

        if self.source.trim().is_empty() {
            return invalid("source path is empty".to_string());
        }
        if !self.source.contains(':') {
            return invalid(format!("source {} must be of the form remote:path", self.source));
        }
        if self.target.as_os_str().is_empty() {
            return invalid("target path is empty".to_string());
        }
        if !self.target.is_absolute() {
            return invalid(format!(
                "target {} must be an absolute path",
                self.target.display()
            ));
        }
        if has_parent_segment(&self.target) {
            return invalid(format!(
                "target {} must not contain '..'",
                self.target.display()
            ));
        }
        let remote_path = self.source.split_once(':').map_or("", |(_, path)| path);
        if remote_path.split(['/', '\\']).any(|segment| segment == "..") {
            return invalid(format!("source {} must not contain '..'", self.source));
        }

        for option in &self.options {
            let option = option.trim();
            if option.is_empty() {
                return invalid("sync options must not be blank".to_string());
            }
            if !(option.contains('=') || option.starts_with('-') || BARE_OPTIONS.contains(&option))
            {
                return invalid(format!("unsupported sync option {option}"));
            }
        }
        Ok(())
    }

    /// `rclone` arguments for this request.
    pub fn command_args(&self) -> Vec<String> {
        let mut args = vec![
            "backend".to_string(),
            "media-sync".to_string(),
            self.source.clone(),
            self.target.display().to_string(),
        ];
        for option in &self.options {
            let option = option.trim();
            if option.starts_with('-') {
                args.push(option.to_string());
            } else {
                args.push("-o".to_string());
                args.push(option.to_string());
            }
        }
        args.push("-vv".to_string());
        args
    }
}

fn has_parent_segment(path: &Path) -> bool {
    path.components()
        .any(|component| matches!(component, Component::ParentDir))
}

/// Backend that materializes a remote tree as strm files.
#[async_trait]
pub trait MediaSyncBackend: Send + Sync {
    /// Runs one sync to completion.
    ///
    /// # Errors
    ///
    /// - `SyncError::CommandFailed` - The sync process failed
    /// - `SyncError::Timeout` - The sync exceeded its deadline
    async fn sync(&self, request: &SyncSource) -> Result<(), SyncError>;
}

/// Syncs with `rclone backend media-sync`.
#[derive(Debug, Clone)]
pub struct RcloneSyncBackend {
    binary: PathBuf,
    timeout: Duration,
}

impl RcloneSyncBackend {
    pub fn new(resolver: &ResolverConfig, tasks: &TaskConfig) -> Self {
        Self {
            binary: resolver.rclone_binary.clone(),
            timeout: tasks.task_timeout,
        }
    }
}

#[async_trait]
impl MediaSyncBackend for RcloneSyncBackend {
    async fn sync(&self, request: &SyncSource) -> Result<(), SyncError> {
        request.validate()?;
        let args = request.command_args();
        tracing::info!("Running rclone {}", args.join(" "));

        let output = run_rclone(&self.binary, &args, Some(self.timeout))
            .await
            .map_err(|e| match e {
                CommandError::Timeout(after) => SyncError::Timeout {
                    source_path: request.source.clone(),
                    after,
                },
                other => SyncError::CommandFailed {
                    source_path: request.source.clone(),
                    reason: other.to_string(),
                },
            })?;

        if !output.trim().is_empty() {
            tracing::debug!("media-sync output: {}", output.trim());
        }
        Ok(())
    }
}

/// Builds sync requests from configured servers and submits them to the
/// task manager.
pub struct SyncService {
    servers: Vec<MediaSyncServer>,
    default_options: Vec<String>,
    tasks: TaskManager,
    backend: Arc<dyn MediaSyncBackend>,
    upstream: Arc<dyn MediaServerClient>,
    schedules: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncService {
    pub fn new(
        servers: Vec<MediaSyncServer>,
        default_options: Vec<String>,
        tasks: TaskManager,
        backend: Arc<dyn MediaSyncBackend>,
        upstream: Arc<dyn MediaServerClient>,
    ) -> Self {
        Self {
            servers,
            default_options,
            tasks,
            backend,
            upstream,
            schedules: Mutex::new(Vec::new()),
        }
    }

    pub fn tasks(&self) -> &TaskManager {
        &self.tasks
    }

    pub fn servers(&self) -> &[MediaSyncServer] {
        &self.servers
    }

    /// Builds the request for syncing `path` of a configured server.
    ///
    /// Without a name the first configured server is used. Without a
    /// target root the server's local path is used.
    ///
    /// # Errors
    ///
    /// - `SyncError::NoServersConfigured` - No media sync servers exist
    /// - `SyncError::UnknownServer` - `server_name` matches no server
    /// - `SyncError::InvalidRequest` - `path` escapes the target root or the
    ///   resulting request is invalid
    pub fn request_for(
        &self,
        server_name: Option<&str>,
        path: &str,
        target_root: Option<&Path>,
    ) -> Result<SyncSource, SyncError> {
        let server = match server_name.filter(|name| !name.is_empty()) {
            Some(name) => self
                .servers
                .iter()
                .find(|server| server.name == name)
                .ok_or_else(|| SyncError::UnknownServer {
                    name: name.to_string(),
                })?,
            None => self.servers.first().ok_or(SyncError::NoServersConfigured)?,
        };

        let relative = path.trim_start_matches('/');
        if relative.split(['/', '\\']).any(|segment| segment == "..") {
            return Err(SyncError::InvalidRequest {
                reason: format!("path {path} must not contain '..'"),
            });
        }
        let root = target_root.unwrap_or(&server.local_path);
        let target = if relative.is_empty() {
            root.to_path_buf()
        } else {
            root.join(relative)
        };
        if !target.starts_with(root) {
            return Err(SyncError::InvalidRequest {
                reason: format!("path {path} escapes {}", root.display()),
            });
        }

        let request = SyncSource {
            source: format!("{}:{relative}", server.remote.trim_end_matches(':')),
            target,
            options: self.default_options.clone(),
        };
        request.validate()?;
        Ok(request)
    }

    /// Validates `request` and submits the sync plus library rescan as
    /// one task.
    ///
    /// # Errors
    ///
    /// - `SyncError::InvalidRequest` - The request failed validation
    /// - `SyncError::Task` - The task manager rejected the submission
    pub fn run_sync_task(
        &self,
        name: impl Into<String>,
        request: SyncSource,
    ) -> Result<TaskTicket, SyncError> {
        request.validate()?;

        let backend = Arc::clone(&self.backend);
        let upstream = Arc::clone(&self.upstream);
        let ticket = self.tasks.run_task_with_name(name, move || async move {
            backend.sync(&request).await?;
            tracing::info!("Sync of {} finished, triggering library scan", request.source);
            upstream.trigger_library_scan().await?;
            Ok::<_, SyncError>(())
        })?;
        Ok(ticket)
    }

    /// Syncs `path` of a configured server.
    ///
    /// # Errors
    ///
    /// See [`SyncService::request_for`] and [`SyncService::run_sync_task`].
    pub fn trigger_for_server(
        &self,
        server_name: Option<&str>,
        path: &str,
        target_root: Option<&Path>,
    ) -> Result<TaskTicket, SyncError> {
        let request = self.request_for(server_name, path, target_root)?;
        let name = format!("sync {}", request.source);
        self.run_sync_task(name, request)
    }

    /// Starts interval loops resubmitting each schedule. Schedules with a
    /// zero interval or an invalid request are skipped.
    ///
    /// Returns the number of schedules started.
    pub fn start_schedules(self: &Arc<Self>, schedules: &[SyncSchedule]) -> usize {
        let mut handles = self.schedules.lock();
        let mut started = 0;

        for schedule in schedules {
            if schedule.interval.is_zero() {
                tracing::warn!("Schedule {} has no interval, skipping", schedule.name);
                continue;
            }
            let request = match self.request_for(Some(&schedule.server), &schedule.path, None) {
                Ok(request) => request,
                Err(e) => {
                    tracing::warn!("Schedule {} is invalid, skipping: {e}", schedule.name);
                    continue;
                }
            };

            let weak = Arc::downgrade(self);
            let name = schedule.name.clone();
            let interval = schedule.interval;
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let Some(service) = weak.upgrade() else {
                        break;
                    };
                    match service.run_sync_task(name.clone(), request.clone()) {
                        Ok(ticket) => tracing::debug!("Scheduled sync {name} queued as {}", ticket.id),
                        Err(SyncError::Task(TaskError::Shutdown)) => break,
                        Err(e) => tracing::warn!("Scheduled sync {name} not queued: {e}"),
                    }
                }
            }));
            started += 1;
        }

        tracing::info!("Started {started} sync schedules");
        started
    }

    /// Stops all schedule loops.
    pub fn close(&self) {
        for handle in self.schedules.lock().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for SyncService {
    fn drop(&mut self) {
        for handle in self.schedules.get_mut().drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::StrmConfig;
    use crate::tasks::TaskOutcome;
    use crate::test_mocks::{MockMediaServer, MockSyncBackend};

    fn request(source: &str, target: &str, options: &[&str]) -> SyncSource {
        SyncSource {
            source: source.to_string(),
            target: PathBuf::from(target),
            options: options.iter().map(|o| o.to_string()).collect(),
        }
    }

    struct Fixture {
        service: Arc<SyncService>,
        backend: Arc<MockSyncBackend>,
        server: Arc<MockMediaServer>,
    }

    fn fixture_with(backend: MockSyncBackend, server: MockMediaServer) -> Fixture {
        let config = StrmConfig::for_testing();
        let backend = Arc::new(backend);
        let server = Arc::new(server);
        let service = Arc::new(SyncService::new(
            vec![
                MediaSyncServer {
                    name: "115".to_string(),
                    remote: "115".to_string(),
                    local_path: PathBuf::from("/mnt/strm/115"),
                },
                MediaSyncServer {
                    name: "od".to_string(),
                    remote: "onedrive:".to_string(),
                    local_path: PathBuf::from("/mnt/strm/od"),
                },
            ],
            config.resolver.default_sync_options.clone(),
            TaskManager::spawn(config.tasks),
            Arc::clone(&backend) as Arc<_>,
            Arc::clone(&server) as Arc<_>,
        ));
        Fixture {
            service,
            backend,
            server,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(MockSyncBackend::new(), MockMediaServer::new())
    }

    #[test]
    fn test_validate_rules() {
        assert!(request("115:movies", "/mnt/a", &["min-size=100M", "--fast", "strm-format"])
            .validate()
            .is_ok());
        assert!(request("", "/mnt/a", &[]).validate().is_err());
        assert!(request("movies", "/mnt/a", &[]).validate().is_err());
        assert!(request("115:movies", "", &[]).validate().is_err());
        assert!(request("115:movies", "relative/dir", &[]).validate().is_err());
        assert!(request("115:movies", "/mnt/a", &["  "]).validate().is_err());
        assert!(request("115:movies", "/mnt/a", &["bogus"]).validate().is_err());
        assert!(request("115:../etc", "/mnt/a", &[]).validate().is_err());
        assert!(request("115:movies", "/mnt/a/../../etc", &[]).validate().is_err());
        assert!(request("115:movies..2024", "/mnt/a..b", &[]).validate().is_ok());
    }

    #[tokio::test]
    async fn test_request_for_rejects_parent_segments() {
        let f = fixture();

        for path in ["../../../etc/cron.d", "/movies/../../etc", "movies/..", ".."] {
            assert!(
                matches!(
                    f.service.request_for(None, path, None),
                    Err(SyncError::InvalidRequest { .. })
                ),
                "{path}"
            );
        }
        assert!(matches!(
            f.service
                .request_for(None, "shows", Some(Path::new("/data/../etc"))),
            Err(SyncError::InvalidRequest { .. })
        ));
        assert!(matches!(
            f.service.trigger_for_server(None, "../../etc", None),
            Err(SyncError::InvalidRequest { .. })
        ));
        assert_eq!(f.backend.call_count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_command_args() {
        let args = request("115:movies", "/mnt/a", &["min-size=100M", "--dry-run"]).command_args();
        assert_eq!(
            args,
            vec![
                "backend",
                "media-sync",
                "115:movies",
                "/mnt/a",
                "-o",
                "min-size=100M",
                "--dry-run",
                "-vv"
            ]
        );
    }

    #[tokio::test]
    async fn test_request_for_resolves_servers() {
        let f = fixture();

        let request = f.service.request_for(None, "/movies/2024", None).unwrap();
        assert_eq!(request.source, "115:movies/2024");
        assert_eq!(request.target, PathBuf::from("/mnt/strm/115/movies/2024"));
        assert_eq!(request.options, vec!["min-size=100M", "strm-format", "sync-delete"]);

        let request = f
            .service
            .request_for(Some("od"), "shows", Some(Path::new("/data")))
            .unwrap();
        assert_eq!(request.source, "onedrive:shows");
        assert_eq!(request.target, PathBuf::from("/data/shows"));

        assert_eq!(
            f.service.request_for(Some("gd"), "x", None),
            Err(SyncError::UnknownServer {
                name: "gd".to_string()
            })
        );
        assert!(matches!(
            f.service.request_for(None, "x", Some(Path::new("relative"))),
            Err(SyncError::InvalidRequest { .. })
        ));
    }

    #[tokio::test]
    async fn test_sync_then_scan() {
        let f = fixture();
        let ticket = f.service.trigger_for_server(None, "movies", None).unwrap();
        assert_eq!(ticket.name, "sync 115:movies");
        assert_eq!(ticket.wait().await.unwrap(), TaskOutcome::Completed);

        assert_eq!(f.backend.requests()[0].source, "115:movies");
        assert_eq!(f.server.scan_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_sync_skips_scan() {
        let f = fixture_with(MockSyncBackend::new_with_failure(), MockMediaServer::new());
        let ticket = f.service.trigger_for_server(None, "movies", None).unwrap();
        assert!(matches!(ticket.wait().await.unwrap(), TaskOutcome::Failed(_)));
        assert_eq!(f.server.scan_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_scan_failure_fails_task() {
        let f = fixture_with(MockSyncBackend::new(), MockMediaServer::new_with_scan_failure());
        let ticket = f.service.trigger_for_server(None, "movies", None).unwrap();
        assert!(matches!(ticket.wait().await.unwrap(), TaskOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_invalid_request_never_submitted() {
        let f = fixture();
        let result = f
            .service
            .run_sync_task("bad", request("nocolon", "/mnt/a", &[]));
        assert!(matches!(result, Err(SyncError::InvalidRequest { .. })));
        assert_eq!(f.service.tasks().status().queue_length, 0);
        assert_eq!(f.backend.call_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_schedules_resubmit() {
        let f = fixture();
        let schedules = vec![
            SyncSchedule {
                name: "nightly".to_string(),
                server: "115".to_string(),
                path: "movies".to_string(),
                interval: Duration::from_millis(40),
            },
            SyncSchedule {
                name: "disabled".to_string(),
                server: "115".to_string(),
                path: "shows".to_string(),
                interval: Duration::ZERO,
            },
        ];

        assert_eq!(f.service.start_schedules(&schedules), 1);
        tokio::time::sleep(Duration::from_millis(300)).await;
        f.service.close();

        assert!(f.backend.call_count.load(Ordering::SeqCst) >= 2);
        assert!(
            f.backend
                .requests()
                .iter()
                .all(|request| request.source == "115:movies")
        );
    }
}
