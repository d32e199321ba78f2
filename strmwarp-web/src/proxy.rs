//! Streaming reverse proxy to the upstream media server.
//!
//! Bodies are streamed in both directions. Redirects from upstream are
//! returned to the client untouched.

use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::Request;
use axum::http::{HeaderMap, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use url::Url;

/// Errors from forwarding a request upstream.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Invalid upstream address {addr}: {reason}")]
    InvalidUpstream { addr: String, reason: String },

    #[error("Upstream request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Failed to build response: {reason}")]
    Response { reason: String },
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        tracing::warn!("Proxy error: {self}");
        let (status, message) = match self {
            ProxyError::Request(ref e) if e.is_timeout() => {
                (StatusCode::GATEWAY_TIMEOUT, "Upstream timed out")
            }
            ProxyError::InvalidUpstream { .. } | ProxyError::Response { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Proxy misconfigured")
            }
            ProxyError::Request(_) => (StatusCode::BAD_GATEWAY, "Upstream unavailable"),
        };
        (status, message).into_response()
    }
}

/// Headers that describe a single hop and must not be forwarded.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Forwards requests to the media server.
#[derive(Debug, Clone)]
pub struct ReverseProxy {
    client: reqwest::Client,
    base: Url,
}

impl ReverseProxy {
    /// # Errors
    ///
    /// - `ProxyError::InvalidUpstream` - `addr` is not an absolute URL
    /// - `ProxyError::Request` - The HTTP client could not be built
    pub fn new(addr: &str, connect_timeout: Duration) -> Result<Self, ProxyError> {
        let base = Url::parse(addr).map_err(|e| ProxyError::InvalidUpstream {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { client, base })
    }

    /// Upstream URL for a client request URI, under the base path of the
    /// configured address.
    pub fn upstream_url(&self, uri: &Uri) -> Url {
        let mut url = self.base.clone();
        let joined = format!("{}{}", self.base.path().trim_end_matches('/'), uri.path());
        url.set_path(&joined);
        url.set_query(uri.query());
        url
    }

    /// Sends a request upstream and returns the raw response.
    ///
    /// # Errors
    ///
    /// - `ProxyError::Request` - Transport failure
    pub async fn send(
        &self,
        method: Method,
        uri: &Uri,
        mut headers: HeaderMap,
        body: Option<reqwest::Body>,
    ) -> Result<reqwest::Response, ProxyError> {
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);

        let url = self.upstream_url(uri);
        tracing::debug!("Proxying {method} {url}");
        let mut builder = self.client.request(method, url).headers(headers);
        if let Some(body) = body {
            builder = builder.body(body);
        }
        Ok(builder.send().await?)
    }

    /// Forwards `request` and streams the upstream response back.
    pub async fn forward(&self, request: Request) -> Response {
        let (parts, body) = request.into_parts();
        // Bodyless methods must not turn into chunked uploads
        let body = (!matches!(parts.method, Method::GET | Method::HEAD))
            .then(|| reqwest::Body::wrap_stream(body.into_data_stream()));

        match self.send(parts.method, &parts.uri, parts.headers, body).await {
            Ok(upstream) => {
                streaming_response(upstream).unwrap_or_else(ProxyError::into_response)
            }
            Err(e) => e.into_response(),
        }
    }

    /// Forwards a request whose body was already read.
    ///
    /// # Errors
    ///
    /// - `ProxyError::Request` - Transport failure
    pub async fn send_buffered(
        &self,
        method: Method,
        uri: &Uri,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<reqwest::Response, ProxyError> {
        let body = (!body.is_empty()).then(|| reqwest::Body::from(body));
        self.send(method, uri, headers, body).await
    }
}

/// Converts an upstream response into a streamed client response.
///
/// # Errors
///
/// - `ProxyError::Response` - Status or headers could not be copied
pub fn streaming_response(upstream: reqwest::Response) -> Result<Response, ProxyError> {
    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    strip_hop_by_hop(&mut headers);

    let mut response = Response::builder()
        .status(status)
        .body(Body::from_stream(upstream.bytes_stream()))
        .map_err(|e| ProxyError::Response {
            reason: e.to_string(),
        })?;
    *response.headers_mut() = headers;
    Ok(response)
}

/// Builds a client response from a buffered upstream body.
pub fn buffered_response(status: StatusCode, mut headers: HeaderMap, body: Bytes) -> Response {
    strip_hop_by_hop(&mut headers);
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(header::CONTENT_ENCODING);

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_url_keeps_path_and_query() {
        let proxy = ReverseProxy::new("http://emby:8096", Duration::from_secs(1)).unwrap();
        let uri: Uri = "/emby/Items/31/PlaybackInfo?UserId=u&api_key=k".parse().unwrap();
        assert_eq!(
            proxy.upstream_url(&uri).as_str(),
            "http://emby:8096/emby/Items/31/PlaybackInfo?UserId=u&api_key=k"
        );

        let uri: Uri = "/web/index.html".parse().unwrap();
        assert_eq!(proxy.upstream_url(&uri).as_str(), "http://emby:8096/web/index.html");
    }

    #[test]
    fn test_upstream_url_keeps_base_path() {
        for addr in ["http://host/emby", "http://host/emby/"] {
            let proxy = ReverseProxy::new(addr, Duration::from_secs(1)).unwrap();
            let uri: Uri = "/Items/31/PlaybackInfo?api_key=k".parse().unwrap();
            assert_eq!(
                proxy.upstream_url(&uri).as_str(),
                "http://host/emby/Items/31/PlaybackInfo?api_key=k"
            );
        }
    }

    #[test]
    fn test_invalid_upstream() {
        assert!(matches!(
            ReverseProxy::new("not a url", Duration::from_secs(1)),
            Err(ProxyError::InvalidUpstream { .. })
        ));
    }

    #[test]
    fn test_buffered_response_drops_stale_length() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, "999".parse().unwrap());
        headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        headers.insert(header::CONNECTION, "keep-alive".parse().unwrap());

        let response = buffered_response(StatusCode::OK, headers, Bytes::from_static(b"{}"));
        assert!(response.headers().get(header::CONTENT_LENGTH).is_none());
        assert!(response.headers().get(header::CONNECTION).is_none());
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
    }
}
