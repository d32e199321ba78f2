//! reqwest-backed client for the Emby and Jellyfin HTTP APIs.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

use super::{ItemsResponse, MediaServerClient, PLAYBACK_FIELDS, ServerItem, UpstreamError};
use crate::config::{MediaServerConfig, ServerKind};

/// Scheduled task Emby runs for a full library scan.
const EMBY_SCAN_TASK_NAME: &str = "Scan media library";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ScheduledTask {
    name: String,
    id: String,
}

/// Media server client speaking the Emby/Jellyfin REST API.
#[derive(Debug, Clone)]
pub struct HttpMediaServerClient {
    client: reqwest::Client,
    base: Url,
    api_key: String,
    kind: ServerKind,
}

impl HttpMediaServerClient {
    /// Creates a client for the configured server.
    ///
    /// # Errors
    ///
    /// - `UpstreamError::Request` - Invalid base address or client configuration
    pub fn new(config: &MediaServerConfig) -> Result<Self, UpstreamError> {
        let base = Url::parse(config.addr.trim_end_matches('/')).map_err(|e| {
            UpstreamError::Request {
                reason: format!("Invalid media server address {}: {e}", config.addr),
            }
        })?;

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("strmwarp/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| UpstreamError::Request {
                reason: format!("Failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            base,
            api_key: config.api_key.clone(),
            kind: config.kind,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Builds `{base}{path}?{params}` preserving any base path prefix.
    pub fn endpoint(&self, path: &str, params: &[(&str, &str)]) -> Url {
        let mut url = self.base.clone();
        let joined = format!(
            "{}/{}",
            url.path().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        url.set_path(&joined);
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params);
        }
        url
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<T, UpstreamError> {
        let response = self
            .client
            .get(url.clone())
            .header("X-Emby-Token", &self.api_key)
            .send()
            .await
            .map_err(|e| map_transport_error(&url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                url: redact(&url),
            });
        }

        response.json().await.map_err(|e| UpstreamError::Decode {
            reason: e.to_string(),
        })
    }

    async fn post_empty(&self, url: Url) -> Result<(), UpstreamError> {
        let response = self
            .client
            .post(url.clone())
            .header("X-Emby-Token", &self.api_key)
            .send()
            .await
            .map_err(|e| map_transport_error(&url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                url: redact(&url),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl MediaServerClient for HttpMediaServerClient {
    fn kind(&self) -> ServerKind {
        self.kind
    }

    async fn query_item(
        &self,
        item_id: &str,
        limit: u32,
        fields: &str,
    ) -> Result<ServerItem, UpstreamError> {
        let limit = limit.to_string();
        let url = self.endpoint(
            "/Items",
            &[("Ids", item_id), ("Fields", fields), ("Limit", &limit)],
        );

        let response: ItemsResponse = self.get_json(url).await?;
        response
            .items
            .into_iter()
            .next()
            .map(|record| ServerItem::from_record(self.kind, record))
            .ok_or_else(|| UpstreamError::ItemNotFound {
                id: item_id.to_string(),
            })
    }

    async fn query_items(
        &self,
        item_ids: &[String],
    ) -> Result<HashMap<String, ServerItem>, UpstreamError> {
        if item_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let ids = item_ids.join(",");
        let url = self.endpoint("/Items", &[("Ids", &ids), ("Fields", PLAYBACK_FIELDS)]);
        let response: ItemsResponse = self.get_json(url).await?;

        Ok(response
            .items
            .into_iter()
            .map(|record| {
                (
                    record.id.clone(),
                    ServerItem::from_record(self.kind, record),
                )
            })
            .collect())
    }

    async fn trigger_library_scan(&self) -> Result<(), UpstreamError> {
        match self.kind {
            ServerKind::Emby => {
                let tasks: Vec<ScheduledTask> =
                    self.get_json(self.endpoint("/ScheduledTasks", &[])).await?;
                let task = tasks
                    .into_iter()
                    .find(|task| task.name == EMBY_SCAN_TASK_NAME)
                    .ok_or(UpstreamError::ScanTaskNotFound)?;

                tracing::info!("Triggering library scan task {}", task.id);
                self.post_empty(self.endpoint(&format!("/ScheduledTasks/Running/{}", task.id), &[]))
                    .await
            }
            ServerKind::Jellyfin => {
                tracing::info!("Triggering library refresh");
                self.post_empty(self.endpoint("/Library/Refresh", &[])).await
            }
        }
    }
}

fn map_transport_error(url: &Url, e: reqwest::Error) -> UpstreamError {
    let target = redact(url);
    let reason = if e.is_timeout() {
        format!("Request timed out: {target}")
    } else if e.is_connect() {
        format!("Failed to connect: {target}")
    } else {
        format!("HTTP request failed: {e}")
    };
    UpstreamError::Request { reason }
}

/// URL without its query string, for logs and errors.
fn redact(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.to_string()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn client(addr: &str) -> HttpMediaServerClient {
        HttpMediaServerClient::new(&MediaServerConfig {
            addr: addr.to_string(),
            api_key: "secret".to_string(),
            request_timeout: Duration::from_secs(1),
            kind: ServerKind::Emby,
        })
        .unwrap()
    }

    #[test]
    fn test_endpoint_joins_paths_and_encodes_params() {
        let client = client("http://emby.local:8096/");
        let url = client.endpoint("/Items", &[("Ids", "1,2"), ("Fields", "Path,MediaSources")]);
        assert_eq!(
            url.as_str(),
            "http://emby.local:8096/Items?Ids=1%2C2&Fields=Path%2CMediaSources"
        );
    }

    #[test]
    fn test_endpoint_keeps_base_prefix() {
        let client = client("http://host/emby");
        let url = client.endpoint("/ScheduledTasks/Running/abc", &[]);
        assert_eq!(url.as_str(), "http://host/emby/ScheduledTasks/Running/abc");
    }

    #[test]
    fn test_invalid_address_is_rejected() {
        let result = HttpMediaServerClient::new(&MediaServerConfig {
            addr: "not a url".to_string(),
            ..Default::default()
        });
        assert!(matches!(result, Err(UpstreamError::Request { .. })));
    }

    #[tokio::test]
    async fn test_unreachable_server_maps_to_request_error() {
        let client = client("http://127.0.0.1:9");
        let result = client.query_item("1", 1, PLAYBACK_FIELDS).await;
        assert!(matches!(result, Err(UpstreamError::Request { .. })));
    }

    #[test]
    fn test_redact_drops_query() {
        let url = Url::parse("http://host/Items?api_key=secret").unwrap();
        assert_eq!(redact(&url), "http://host/Items");
    }
}
