//! Mock collaborators for testing resolution, warming and sync without
//! a media server or rclone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use crate::remote::{RemoteLinkResolver, RemoteTarget, ResolveError};
use crate::tasks::{MediaSyncBackend, SyncError, SyncSource};
use crate::upstream::{
    ItemRecord, MediaServerClient, MediaSourceInfo, ServerItem, ServerKind, UpstreamError,
};

/// In-memory media server.
#[derive(Debug)]
pub struct MockMediaServer {
    kind: ServerKind,
    items: RwLock<HashMap<String, ItemRecord>>,
    latency: Duration,
    should_fail_query: bool,
    should_fail_scan: bool,
    /// Single-item queries served
    pub query_count: AtomicUsize,
    /// Multi-item queries served
    pub batch_query_count: AtomicUsize,
    /// Library scans triggered
    pub scan_count: AtomicUsize,
}

impl MockMediaServer {
    pub fn new() -> Self {
        Self {
            kind: ServerKind::Emby,
            items: RwLock::new(HashMap::new()),
            latency: Duration::ZERO,
            should_fail_query: false,
            should_fail_scan: false,
            query_count: AtomicUsize::new(0),
            batch_query_count: AtomicUsize::new(0),
            scan_count: AtomicUsize::new(0),
        }
    }

    /// Creates a server whose item queries fail with a transport error.
    pub fn new_with_query_failure() -> Self {
        Self {
            should_fail_query: true,
            ..Self::new()
        }
    }

    /// Creates a server whose library scans fail.
    pub fn new_with_scan_failure() -> Self {
        Self {
            should_fail_scan: true,
            ..Self::new()
        }
    }

    pub fn with_kind(mut self, kind: ServerKind) -> Self {
        self.kind = kind;
        self
    }

    /// Delays every query by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Adds a strm item whose single media source points at `source_path`.
    pub fn add_strm_item(&self, id: &str, item_path: &str, source_path: &str) {
        self.add_item(id, item_path, source_path);
    }

    /// Adds a regular media file item.
    pub fn add_local_item(&self, id: &str, path: &str) {
        self.add_item(id, path, path);
    }

    fn add_item(&self, id: &str, item_path: &str, source_path: &str) {
        let record = ItemRecord {
            id: id.to_string(),
            name: Some(format!("Item {id}")),
            path: Some(item_path.to_string()),
            media_sources: vec![MediaSourceInfo {
                id: format!("mediasource_{id}"),
                path: Some(source_path.to_string()),
                protocol: Some("File".to_string()),
                ..Default::default()
            }],
        };
        self.items.write().insert(id.to_string(), record);
    }

    async fn simulate_request(&self) -> Result<(), UpstreamError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.should_fail_query {
            return Err(UpstreamError::Request {
                reason: "mock connection refused".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for MockMediaServer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaServerClient for MockMediaServer {
    fn kind(&self) -> ServerKind {
        self.kind
    }

    async fn query_item(
        &self,
        item_id: &str,
        _limit: u32,
        _fields: &str,
    ) -> Result<ServerItem, UpstreamError> {
        self.query_count.fetch_add(1, Ordering::SeqCst);
        self.simulate_request().await?;

        self.items
            .read()
            .get(item_id)
            .cloned()
            .map(|record| ServerItem::from_record(self.kind, record))
            .ok_or_else(|| UpstreamError::ItemNotFound {
                id: item_id.to_string(),
            })
    }

    async fn query_items(
        &self,
        item_ids: &[String],
    ) -> Result<HashMap<String, ServerItem>, UpstreamError> {
        self.batch_query_count.fetch_add(1, Ordering::SeqCst);
        self.simulate_request().await?;

        let items = self.items.read();
        Ok(item_ids
            .iter()
            .filter_map(|id| {
                items
                    .get(id)
                    .map(|record| (id.clone(), ServerItem::from_record(self.kind, record.clone())))
            })
            .collect())
    }

    async fn trigger_library_scan(&self) -> Result<(), UpstreamError> {
        self.scan_count.fetch_add(1, Ordering::SeqCst);
        if self.should_fail_scan {
            return Err(UpstreamError::ScanTaskNotFound);
        }
        Ok(())
    }
}

/// Link resolver returning a fixed URL.
#[derive(Debug)]
pub struct MockLinkResolver {
    url: String,
    latency: Duration,
    should_fail: bool,
    calls: Mutex<Vec<(String, String)>>,
    pub call_count: AtomicUsize,
}

impl MockLinkResolver {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            latency: Duration::ZERO,
            should_fail: false,
            calls: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    /// Creates a resolver whose every call fails.
    pub fn new_with_failure() -> Self {
        Self {
            should_fail: true,
            ..Self::new("")
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// `(target, user_agent)` pairs received so far.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl RemoteLinkResolver for MockLinkResolver {
    async fn download_url(
        &self,
        target: &RemoteTarget,
        user_agent: &str,
    ) -> Result<String, ResolveError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        self.calls
            .lock()
            .push((target.to_string(), user_agent.to_string()));

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.should_fail {
            return Err(ResolveError::CommandFailed {
                target: target.to_string(),
                reason: "mock failure".to_string(),
            });
        }
        Ok(self.url.clone())
    }
}

/// Sync backend that records requests instead of running rclone.
#[derive(Debug, Default)]
pub struct MockSyncBackend {
    latency: Duration,
    should_fail: bool,
    requests: Mutex<Vec<SyncSource>>,
    pub call_count: AtomicUsize,
}

impl MockSyncBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_with_failure() -> Self {
        Self {
            should_fail: true,
            ..Self::default()
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn requests(&self) -> Vec<SyncSource> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl MediaSyncBackend for MockSyncBackend {
    async fn sync(&self, request: &SyncSource) -> Result<(), SyncError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.should_fail {
            return Err(SyncError::CommandFailed {
                source_path: request.source.clone(),
                reason: "mock sync failure".to_string(),
            });
        }
        Ok(())
    }
}
