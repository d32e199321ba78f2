//! Request parsing helpers shared by handlers.

use axum::http::{HeaderMap, Uri, header};

/// Returns the first query parameter named `name`, compared
/// case-insensitively since clients disagree on `MediaSourceId` casing.
pub fn query_param(uri: &Uri, name: &str) -> Option<String> {
    let query = uri.query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.into_owned())
}

/// Client user agent, empty when absent or not valid UTF-8.
pub fn user_agent(headers: &HeaderMap) -> String {
    headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Value of a custom header, trimmed; `None` when absent or blank.
pub fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Headers that carry the client's media server token.
const TOKEN_HEADERS: [&str; 3] = ["x-emby-token", "x-mediabrowser-token", "authorization"];

/// Identity of a PlaybackInfo request for caching its rewritten response.
///
/// Responses embed the caller's token and honor the query and device
/// profile, so all of them take part in the identity.
pub fn playback_cache_id(item_id: &str, uri: &Uri, headers: &HeaderMap, body: &[u8]) -> String {
    let tokens: Vec<&str> = TOKEN_HEADERS
        .iter()
        .filter_map(|name| headers.get(*name).and_then(|value| value.to_str().ok()))
        .collect();
    format!(
        "{item_id}|{}|{}|{}",
        uri.query().unwrap_or_default(),
        tokens.join(","),
        String::from_utf8_lossy(body)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_param_is_case_insensitive() {
        let uri: Uri = "/videos/31/stream?mediaSourceId=mediasource_31&Static=true"
            .parse()
            .unwrap();
        assert_eq!(query_param(&uri, "MediaSourceId").as_deref(), Some("mediasource_31"));
        assert_eq!(query_param(&uri, "Missing"), None);

        let uri: Uri = "/videos/31/stream".parse().unwrap();
        assert_eq!(query_param(&uri, "MediaSourceId"), None);
    }

    #[test]
    fn test_header_helpers() {
        let mut headers = HeaderMap::new();
        assert_eq!(user_agent(&headers), "");
        headers.insert(header::USER_AGENT, "VLC/3.0".parse().unwrap());
        headers.insert("x-sync-server", "  ".parse().unwrap());
        assert_eq!(user_agent(&headers), "VLC/3.0");
        assert_eq!(header_value(&headers, "X-Sync-Server"), None);
    }

    #[test]
    fn test_playback_cache_id_separates_clients() {
        let uri: Uri = "/Items/31/PlaybackInfo?UserId=u1&api_key=a".parse().unwrap();
        let other: Uri = "/Items/31/PlaybackInfo?UserId=u2&api_key=b".parse().unwrap();
        let headers = HeaderMap::new();

        let id = playback_cache_id("31", &uri, &headers, b"{}");
        assert_eq!(id, playback_cache_id("31", &uri, &headers, b"{}"));
        assert_ne!(id, playback_cache_id("31", &other, &headers, b"{}"));
        assert_ne!(id, playback_cache_id("32", &uri, &headers, b"{}"));

        let mut with_token = HeaderMap::new();
        with_token.insert("X-Emby-Token", "t1".parse().unwrap());
        assert_ne!(id, playback_cache_id("31", &uri, &with_token, b"{}"));
    }
}
