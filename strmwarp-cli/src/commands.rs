//! CLI command implementations

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::Subcommand;
use strmwarp_core::ServerComponents;
use strmwarp_core::config::{ServerKind, StrmConfig};
use strmwarp_core::strm::StrmClassifier;
use strmwarp_core::tasks::TaskOutcome;

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run the reverse proxy
    Serve {
        /// Address to listen on
        #[arg(short, long)]
        listen: Option<SocketAddr>,
        /// Media server base URL, e.g. http://127.0.0.1:8096
        #[arg(short, long)]
        upstream: Option<String>,
        /// Media server API key
        #[arg(long)]
        upstream_api_key: Option<String>,
        /// Media server flavour
        #[arg(long, value_enum)]
        kind: Option<ServerKind>,
        /// Key required by the sync and cache control endpoints
        #[arg(long)]
        api_key: Option<String>,
    },
    /// Sync a remote path once, then trigger a library scan
    Sync {
        /// Path below the remote root
        path: String,
        /// Media sync server name (defaults to the first configured)
        #[arg(short, long)]
        server: Option<String>,
        /// Local target root override
        #[arg(short, long)]
        target_root: Option<PathBuf>,
    },
    /// Print how a media path would be classified
    Classify {
        /// Media file or strm path
        path: String,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns the error of the command that failed
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Serve {
            listen,
            upstream,
            upstream_api_key,
            kind,
            api_key,
        } => {
            let mut config = StrmConfig::from_env();
            apply_serve_overrides(&mut config, listen, upstream, upstream_api_key, kind, api_key);
            serve(config).await
        }
        Commands::Sync {
            path,
            server,
            target_root,
        } => sync_once(StrmConfig::from_env(), &path, server, target_root).await,
        Commands::Classify { path } => classify(&StrmConfig::from_env(), &path).await,
    }
}

fn apply_serve_overrides(
    config: &mut StrmConfig,
    listen: Option<SocketAddr>,
    upstream: Option<String>,
    upstream_api_key: Option<String>,
    kind: Option<ServerKind>,
    api_key: Option<String>,
) {
    if let Some(listen) = listen {
        config.server.listen_addr = listen;
    }
    if let Some(upstream) = upstream {
        config.media_server.addr = upstream;
    }
    if let Some(key) = upstream_api_key {
        config.media_server.api_key = key;
    }
    if let Some(kind) = kind {
        config.media_server.kind = kind;
    }
    if let Some(key) = api_key.filter(|key| !key.is_empty()) {
        config.server.api_key = Some(key);
    }
}

/// Run the proxy until Ctrl-C
///
/// # Errors
/// - Service construction, bind or serve failures
pub async fn serve(config: StrmConfig) -> anyhow::Result<()> {
    tracing::info!(
        "Starting Strmwarp in front of {} at {}",
        config.media_server.kind,
        config.media_server.addr
    );
    strmwarp_web::run_server(config)
        .await
        .context("Server stopped with an error")
}

/// Run one sync through a dedicated task manager and wait for it
///
/// # Errors
/// - Unknown server, invalid request, or a failed or timed out sync
pub async fn sync_once(
    config: StrmConfig,
    path: &str,
    server: Option<String>,
    target_root: Option<PathBuf>,
) -> anyhow::Result<()> {
    let components = ServerComponents::from_config(config)?;
    let ticket = components
        .sync
        .trigger_for_server(server.as_deref(), path, target_root.as_deref())?;
    println!("Queued {} ({})", ticket.name, ticket.id);

    let outcome = ticket.wait().await;
    components.shutdown().await;

    match outcome? {
        TaskOutcome::Completed => {
            println!("Sync completed");
            Ok(())
        }
        TaskOutcome::Failed(reason) => bail!("Sync failed: {reason}"),
        TaskOutcome::TimedOut => bail!("Sync timed out"),
    }
}

/// Print the classification of `path`
///
/// # Errors
/// Never fails; unreadable strm files classify as HTTP strm
pub async fn classify(config: &StrmConfig, path: &str) -> anyhow::Result<()> {
    let classifier = StrmClassifier::new(config.local_sync_prefixes());
    let classification = classifier.classify(path).await;
    let redirects = if classification.is_strm() { "redirected" } else { "proxied" };
    println!("{path}: {classification:?} ({redirects})");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use strmwarp_core::strm::StrmClassification;

    use super::*;

    #[test]
    fn test_serve_overrides() {
        let mut config = StrmConfig::default();
        apply_serve_overrides(
            &mut config,
            Some("127.0.0.1:9999".parse().unwrap()),
            Some("http://emby:8096".to_string()),
            None,
            Some(ServerKind::Jellyfin),
            Some(String::new()),
        );
        assert_eq!(config.server.listen_addr.port(), 9999);
        assert_eq!(config.media_server.addr, "http://emby:8096");
        assert_eq!(config.media_server.kind, ServerKind::Jellyfin);
        // Empty key keeps sync disabled
        assert!(config.server.api_key.is_none());
    }

    #[tokio::test]
    async fn test_classify_reads_strm_file() {
        let mut file = tempfile::Builder::new().suffix(".strm").tempfile().unwrap();
        writeln!(file, "od://movies/film.mkv").unwrap();
        let path = file.path().to_string_lossy().to_string();

        let classifier = StrmClassifier::new(StrmConfig::default().local_sync_prefixes());
        assert_eq!(
            classifier.classify(&path).await,
            StrmClassification::RemoteStrm {
                scheme: "od".to_string()
            }
        );
        classify(&StrmConfig::default(), &path).await.unwrap();
    }
}
