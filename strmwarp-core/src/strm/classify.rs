//! Strm path classification.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::remote::{RemoteTarget, is_http_url};

/// What a stored media path points at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StrmClassification {
    /// A regular media file the upstream server streams itself
    LocalFile,
    /// A strm whose target is a literal HTTP(S) URL
    HttpStrm,
    /// A strm pointing into remote storage that needs URL resolution
    RemoteStrm { scheme: String },
    /// Reserved; the classifier never produces it
    Unknown,
}

impl StrmClassification {
    pub fn is_strm(&self) -> bool {
        matches!(
            self,
            StrmClassification::HttpStrm | StrmClassification::RemoteStrm { .. }
        )
    }
}

/// Classifies content read from a `.strm` file.
///
/// Anything that is neither a remote reference nor an HTTP(S) URL
/// defaults to [`StrmClassification::HttpStrm`].
pub fn classify_content(content: &str) -> StrmClassification {
    let content = content.trim();
    if let Some(target) = RemoteTarget::parse(content) {
        return StrmClassification::RemoteStrm {
            scheme: target.scheme().to_string(),
        };
    }
    if !is_http_url(content) {
        tracing::debug!("Unrecognized strm content, treating as HTTP strm");
    }
    StrmClassification::HttpStrm
}

/// True if `path` has a `.strm` extension, case-insensitively.
pub fn is_strm_path(path: &str) -> bool {
    Path::new(path)
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("strm"))
}

/// Classifies media paths using configured local sync mounts and strm content.
#[derive(Debug, Clone, Default)]
pub struct StrmClassifier {
    local_sync_prefixes: Vec<PathBuf>,
}

impl StrmClassifier {
    /// Empty prefixes are ignored so they never match every path.
    pub fn new(local_sync_prefixes: Vec<PathBuf>) -> Self {
        Self {
            local_sync_prefixes: local_sync_prefixes
                .into_iter()
                .filter(|prefix| !prefix.as_os_str().is_empty())
                .collect(),
        }
    }

    /// True if `path` lies under a local sync mount.
    pub fn is_local_sync_path(&self, path: &str) -> bool {
        let candidate = Path::new(path);
        self.local_sync_prefixes
            .iter()
            .any(|prefix| candidate.starts_with(prefix))
    }

    /// Classifies `path`, reading a `.strm` file at most once.
    ///
    /// A local sync mount match short-circuits without any file I/O. An
    /// unreadable strm file is treated as HTTP strm.
    pub async fn classify(&self, path: &str) -> StrmClassification {
        if self.is_local_sync_path(path) {
            tracing::debug!("{path} is under a local sync mount");
            return StrmClassification::HttpStrm;
        }

        if !is_strm_path(path) {
            return StrmClassification::LocalFile;
        }

        match tokio::fs::read_to_string(path).await {
            Ok(content) => classify_content(&content),
            Err(e) => {
                tracing::warn!("Failed to read strm file {path}: {e}");
                StrmClassification::HttpStrm
            }
        }
    }
}
