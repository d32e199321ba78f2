//! PlaybackInfo rewriting for strm media sources.
//!
//! Strm sources are forced to direct play: transcoding fields are removed
//! and `DirectStreamUrl` points back at this proxy's stream route.

use std::collections::HashMap;

use serde_json::Value;

use super::StrmClassification;

const TRANSCODING_FIELDS: [&str; 3] = [
    "TranscodingUrl",
    "TranscodingSubProtocol",
    "TranscodingContainer",
];

/// Query keys that carry the client's credentials in stream URLs.
const API_KEY_PARAMS: [&str; 2] = ["api_key", "X-Emby-Token"];

/// Extracts the `key=value` credential pair from a stream URL's query.
pub fn api_key_pair(stream_url: &str) -> Option<String> {
    let (_, query) = stream_url.split_once('?')?;
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        API_KEY_PARAMS
            .iter()
            .any(|known| known.eq_ignore_ascii_case(key))
            .then(|| format!("{key}={value}"))
    })
}

/// Rewrites strm media sources in a PlaybackInfo body in place.
///
/// `decisions` maps media source ids to their classification; sources
/// without a decision are left untouched. Returns the number of sources
/// rewritten.
pub fn rewrite_playback_info(
    body: &mut Value,
    decisions: &HashMap<String, StrmClassification>,
    item_id: &str,
) -> usize {
    let Some(sources) = body.get_mut("MediaSources").and_then(Value::as_array_mut) else {
        return 0;
    };

    let mut rewritten = 0;
    for source in sources.iter_mut() {
        let Some(source) = source.as_object_mut() else {
            continue;
        };
        let Some(source_id) = source.get("Id").and_then(Value::as_str).map(str::to_string) else {
            continue;
        };
        if !decisions
            .get(&source_id)
            .is_some_and(StrmClassification::is_strm)
        {
            continue;
        }

        source.insert("SupportsDirectPlay".to_string(), Value::Bool(true));
        source.insert("SupportsDirectStream".to_string(), Value::Bool(true));
        for field in TRANSCODING_FIELDS {
            source.remove(field);
        }

        let source_item_id = source
            .get("ItemId")
            .and_then(Value::as_str)
            .unwrap_or(item_id)
            .to_string();
        let credentials = source
            .get("DirectStreamUrl")
            .and_then(Value::as_str)
            .and_then(api_key_pair);

        if let Some(credentials) = credentials {
            let url = format!(
                "/videos/{source_item_id}/stream?MediaSourceId={source_id}&Static=true&{credentials}"
            );
            tracing::info!("Direct play forced for {source_id}: {url}");
            source.insert("DirectStreamUrl".to_string(), Value::String(url));
        }
        rewritten += 1;
    }
    rewritten
}

/// Media source ids listed in a PlaybackInfo body.
pub fn media_source_ids(body: &Value) -> Vec<String> {
    body.get("MediaSources")
        .and_then(Value::as_array)
        .map(|sources| {
            sources
                .iter()
                .filter_map(|source| source.get("Id").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_api_key_pair() {
        assert_eq!(
            api_key_pair("/videos/1/stream.mkv?Static=true&api_key=abc").as_deref(),
            Some("api_key=abc")
        );
        assert_eq!(
            api_key_pair("/videos/1/stream?x-emby-token=t1").as_deref(),
            Some("x-emby-token=t1")
        );
        assert_eq!(api_key_pair("/videos/1/stream?Static=true"), None);
        assert_eq!(api_key_pair("/videos/1/stream"), None);
    }

    #[test]
    fn test_rewrite_only_strm_sources() {
        let mut body = json!({
            "MediaSources": [
                {
                    "Id": "mediasource_31",
                    "ItemId": "31",
                    "SupportsDirectPlay": false,
                    "SupportsDirectStream": false,
                    "TranscodingUrl": "/videos/31/master.m3u8",
                    "TranscodingSubProtocol": "hls",
                    "TranscodingContainer": "ts",
                    "DirectStreamUrl": "/videos/31/original.mkv?MediaSourceId=mediasource_31&api_key=k"
                },
                {
                    "Id": "mediasource_32",
                    "SupportsDirectPlay": false,
                    "TranscodingUrl": "/videos/32/master.m3u8"
                }
            ],
            "PlaySessionId": "abc"
        });

        let decisions = HashMap::from([
            (
                "mediasource_31".to_string(),
                StrmClassification::RemoteStrm {
                    scheme: "115".to_string(),
                },
            ),
            ("mediasource_32".to_string(), StrmClassification::LocalFile),
        ]);

        assert_eq!(rewrite_playback_info(&mut body, &decisions, "31"), 1);

        let strm = &body["MediaSources"][0];
        assert_eq!(strm["SupportsDirectPlay"], true);
        assert_eq!(strm["SupportsDirectStream"], true);
        assert!(strm.get("TranscodingUrl").is_none());
        assert!(strm.get("TranscodingContainer").is_none());
        assert_eq!(
            strm["DirectStreamUrl"],
            "/videos/31/stream?MediaSourceId=mediasource_31&Static=true&api_key=k"
        );

        let local = &body["MediaSources"][1];
        assert_eq!(local["SupportsDirectPlay"], false);
        assert_eq!(local["TranscodingUrl"], "/videos/32/master.m3u8");
        assert_eq!(body["PlaySessionId"], "abc");
    }

    #[test]
    fn test_media_source_ids() {
        let body = json!({"MediaSources": [{"Id": "a"}, {"Name": "no id"}, {"Id": "b"}]});
        assert_eq!(media_source_ids(&body), vec!["a", "b"]);
        assert!(media_source_ids(&json!({})).is_empty());
    }
}
