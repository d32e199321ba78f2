//! rclone command-line integration.
//!
//! Every invocation runs with `kill_on_drop`, so a caller-side timeout or
//! cancellation also terminates the child process.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::{RemoteLinkResolver, RemoteTarget, ResolveError, is_http_url};
use crate::config::ResolverConfig;

/// Failure of a single rclone invocation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum CommandError {
    #[error("failed to spawn {binary}: {reason}")]
    Spawn { binary: String, reason: String },

    #[error("exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Runs `binary args...`, returning stdout on success.
pub(crate) async fn run_rclone(
    binary: &Path,
    args: &[String],
    timeout: Option<Duration>,
) -> Result<String, CommandError> {
    let mut cmd = Command::new(binary);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|e| CommandError::Spawn {
        binary: binary.display().to_string(),
        reason: e.to_string(),
    })?;

    let output = match timeout {
        Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
            .await
            .map_err(|_| CommandError::Timeout(limit))?,
        None => child.wait_with_output().await,
    }
    .map_err(|e| CommandError::Spawn {
        binary: binary.display().to_string(),
        reason: e.to_string(),
    })?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(CommandError::Failed {
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Resolves download URLs with `rclone backend get-download-url`.
#[derive(Debug, Clone)]
pub struct RcloneLinkResolver {
    binary: PathBuf,
    default_user_agent: String,
}

impl RcloneLinkResolver {
    pub fn new(config: &ResolverConfig) -> Self {
        Self {
            binary: config.rclone_binary.clone(),
            default_user_agent: config.default_user_agent.clone(),
        }
    }

    /// Arguments for resolving `target`, substituting the default user agent
    /// when the client sent none.
    pub fn command_args(&self, target: &RemoteTarget, user_agent: &str) -> Vec<String> {
        let user_agent = if user_agent.trim().is_empty() {
            self.default_user_agent.as_str()
        } else {
            user_agent
        };

        vec![
            "backend".to_string(),
            "get-download-url".to_string(),
            format!("{}:", target.scheme()),
            target.to_string(),
            "-o".to_string(),
            format!("user-agent={user_agent}"),
        ]
    }
}

/// Extracts the URL from `rclone backend` output.
///
/// rclone prints command results as JSON, so a bare string result arrives
/// quoted; unquoted output is accepted as well.
pub fn parse_download_url(stdout: &str) -> Option<String> {
    let trimmed = stdout.trim();
    let url = serde_json::from_str::<String>(trimmed).unwrap_or_else(|_| trimmed.to_string());
    is_http_url(&url).then_some(url)
}

#[async_trait]
impl RemoteLinkResolver for RcloneLinkResolver {
    async fn download_url(
        &self,
        target: &RemoteTarget,
        user_agent: &str,
    ) -> Result<String, ResolveError> {
        let args = self.command_args(target, user_agent);
        tracing::debug!("Resolving {target} via rclone");

        let stdout = run_rclone(&self.binary, &args, None)
            .await
            .map_err(|e| match e {
                CommandError::Spawn { reason, .. } => ResolveError::Spawn { reason },
                other => ResolveError::CommandFailed {
                    target: target.to_string(),
                    reason: other.to_string(),
                },
            })?;

        parse_download_url(&stdout).ok_or_else(|| ResolveError::EmptyUrl {
            target: target.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(binary: impl Into<PathBuf>) -> RcloneLinkResolver {
        RcloneLinkResolver::new(&ResolverConfig {
            rclone_binary: binary.into(),
            ..Default::default()
        })
    }

    #[test]
    fn test_command_args_use_default_user_agent() {
        let resolver = resolver("rclone");
        let target = RemoteTarget::parse("115://movies/a.mkv").unwrap();

        let args = resolver.command_args(&target, "");
        assert_eq!(args[..4], ["backend", "get-download-url", "115:", "115://movies/a.mkv"]);
        assert!(args[5].starts_with("user-agent=Mozilla/5.0"));

        let args = resolver.command_args(&target, "VLC/3.0");
        assert_eq!(args[5], "user-agent=VLC/3.0");
    }

    #[test]
    fn test_parse_download_url() {
        assert_eq!(
            parse_download_url("\"https://cdn.example/a?sig=1\"\n").as_deref(),
            Some("https://cdn.example/a?sig=1")
        );
        assert_eq!(
            parse_download_url("https://cdn.example/b").as_deref(),
            Some("https://cdn.example/b")
        );
        assert_eq!(parse_download_url(""), None);
        assert_eq!(parse_download_url("error: not found"), None);
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let resolver = resolver("/nonexistent/rclone-binary");
        let target = RemoteTarget::parse("115://a.mkv").unwrap();
        let result = resolver.download_url(&target, "ua").await;
        assert!(matches!(result, Err(ResolveError::Spawn { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_resolves_through_rclone_script() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("rclone");
        std::fs::write(&script, "#!/bin/sh\necho '\"https://cdn.example/signed\"'\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let resolver = resolver(&script);
        let target = RemoteTarget::parse("115://movies/a.mkv").unwrap();
        let url = resolver.download_url(&target, "VLC").await.unwrap();
        assert_eq!(url, "https://cdn.example/signed");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_rclone_timeout_and_failure() {
        let sleep = run_rclone(
            Path::new("sleep"),
            &["5".to_string()],
            Some(Duration::from_millis(50)),
        )
        .await;
        assert_eq!(sleep, Err(CommandError::Timeout(Duration::from_millis(50))));

        let failed = run_rclone(Path::new("false"), &[], None).await;
        assert!(matches!(failed, Err(CommandError::Failed { .. })));
    }
}
