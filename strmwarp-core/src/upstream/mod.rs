//! Upstream media server boundary.
//!
//! Item records are modelled once and tagged with the server flavour that
//! produced them, so handlers branch on [`ServerItem`] instead of checking
//! parallel optional fields.

pub mod http;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use crate::config::ServerKind;
pub use http::HttpMediaServerClient;

/// Fields requested from the items endpoint when resolving playback.
pub const PLAYBACK_FIELDS: &str = "Path,MediaSources";

/// Errors from the upstream media server API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    #[error("Upstream request failed: {reason}")]
    Request { reason: String },

    #[error("Upstream returned status {status} for {url}")]
    Status { status: u16, url: String },

    #[error("Item not found: {id}")]
    ItemNotFound { id: String },

    #[error("Failed to decode upstream response: {reason}")]
    Decode { reason: String },

    #[error("Library scan task not found on upstream server")]
    ScanTaskNotFound,
}

/// One playable representation of an item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MediaSourceInfo {
    pub id: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub container: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Item fields the proxy relies on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ItemRecord {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub media_sources: Vec<MediaSourceInfo>,
}

/// `/Items` query response envelope.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ItemsResponse {
    #[serde(default)]
    pub items: Vec<ItemRecord>,
    #[serde(default)]
    pub total_record_count: u64,
}

/// An item record tagged with the server flavour it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "server", content = "item", rename_all = "lowercase")]
pub enum ServerItem {
    Emby(ItemRecord),
    Jellyfin(ItemRecord),
}

impl ServerItem {
    pub fn from_record(kind: ServerKind, record: ItemRecord) -> Self {
        match kind {
            ServerKind::Emby => ServerItem::Emby(record),
            ServerKind::Jellyfin => ServerItem::Jellyfin(record),
        }
    }

    pub fn kind(&self) -> ServerKind {
        match self {
            ServerItem::Emby(_) => ServerKind::Emby,
            ServerItem::Jellyfin(_) => ServerKind::Jellyfin,
        }
    }

    pub fn record(&self) -> &ItemRecord {
        match self {
            ServerItem::Emby(record) | ServerItem::Jellyfin(record) => record,
        }
    }

    pub fn id(&self) -> &str {
        &self.record().id
    }

    pub fn path(&self) -> Option<&str> {
        self.record().path.as_deref()
    }

    pub fn media_sources(&self) -> &[MediaSourceInfo] {
        &self.record().media_sources
    }

    /// Finds a media source by id.
    ///
    /// Emby 4.9+ reports ids as `mediasource_<n>` while clients may send
    /// either form, so both the raw and the bare id are accepted.
    pub fn find_media_source(&self, media_source_id: &str) -> Option<&MediaSourceInfo> {
        let bare = strip_media_source_prefix(media_source_id);
        self.media_sources()
            .iter()
            .find(|source| source.id == media_source_id)
            .or_else(|| {
                self.media_sources()
                    .iter()
                    .find(|source| strip_media_source_prefix(&source.id) == bare)
            })
    }
}

/// Full PlaybackInfo response body, tagged with its server flavour.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "server", content = "body", rename_all = "lowercase")]
pub enum ServerPlayback {
    Emby(serde_json::Value),
    Jellyfin(serde_json::Value),
}

impl ServerPlayback {
    pub fn from_body(kind: ServerKind, body: serde_json::Value) -> Self {
        match kind {
            ServerKind::Emby => ServerPlayback::Emby(body),
            ServerKind::Jellyfin => ServerPlayback::Jellyfin(body),
        }
    }

    pub fn body(&self) -> &serde_json::Value {
        match self {
            ServerPlayback::Emby(body) | ServerPlayback::Jellyfin(body) => body,
        }
    }

    pub fn into_body(self) -> serde_json::Value {
        match self {
            ServerPlayback::Emby(body) | ServerPlayback::Jellyfin(body) => body,
        }
    }
}

/// Strips the `mediasource_` prefix Emby 4.9+ puts on media source ids.
pub fn strip_media_source_prefix(media_source_id: &str) -> &str {
    media_source_id
        .strip_prefix("mediasource_")
        .unwrap_or(media_source_id)
}

/// Upstream media server API used by the resolution engine and sync jobs.
#[async_trait]
pub trait MediaServerClient: Send + Sync {
    fn kind(&self) -> ServerKind;

    /// Fetches one item with the given fields.
    ///
    /// # Errors
    ///
    /// - `UpstreamError::ItemNotFound` - The query returned no items
    /// - `UpstreamError::Request` / `Status` - Transport or HTTP failure
    async fn query_item(
        &self,
        item_id: &str,
        limit: u32,
        fields: &str,
    ) -> Result<ServerItem, UpstreamError>;

    /// Fetches several items, keyed by id. Ids the server does not know are absent.
    async fn query_items(
        &self,
        item_ids: &[String],
    ) -> Result<HashMap<String, ServerItem>, UpstreamError> {
        let mut items = HashMap::with_capacity(item_ids.len());
        for item_id in item_ids {
            match self.query_item(item_id, 1, PLAYBACK_FIELDS).await {
                Ok(item) => {
                    items.insert(item_id.clone(), item);
                }
                Err(UpstreamError::ItemNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(items)
    }

    /// Asks the server to rescan its libraries.
    async fn trigger_library_scan(&self) -> Result<(), UpstreamError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_items_response_decodes_pascal_case() {
        let body = r#"{
            "Items": [{
                "Id": "31",
                "Name": "Movie",
                "Path": "/mnt/strm/movie.strm",
                "MediaSources": [
                    {"Id": "mediasource_31", "Path": "115://movies/movie.mkv", "Protocol": "File"}
                ],
                "RunTimeTicks": 123
            }],
            "TotalRecordCount": 1
        }"#;

        let response: ItemsResponse = serde_json::from_str(body).unwrap();
        assert_eq!(response.total_record_count, 1);
        let item = &response.items[0];
        assert_eq!(item.id, "31");
        assert_eq!(item.media_sources[0].path.as_deref(), Some("115://movies/movie.mkv"));
        assert_eq!(item.media_sources[0].container, None);
    }

    #[test]
    fn test_find_media_source_accepts_both_id_forms() {
        let item = ServerItem::Emby(ItemRecord {
            id: "31".to_string(),
            media_sources: vec![
                MediaSourceInfo {
                    id: "mediasource_30".to_string(),
                    ..Default::default()
                },
                MediaSourceInfo {
                    id: "mediasource_31".to_string(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        });

        assert_eq!(item.find_media_source("mediasource_31").unwrap().id, "mediasource_31");
        assert_eq!(item.find_media_source("31").unwrap().id, "mediasource_31");
        assert!(item.find_media_source("99").is_none());
        assert_eq!(item.kind(), ServerKind::Emby);
    }

    #[test]
    fn test_strip_media_source_prefix() {
        assert_eq!(strip_media_source_prefix("mediasource_12"), "12");
        assert_eq!(strip_media_source_prefix("12"), "12");
    }
}
