//! Remote storage targets and download URL resolution.

pub mod rclone;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

pub use rclone::RcloneLinkResolver;

/// Errors from resolving a remote target into a playable URL.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("Download URL resolution for {target} timed out after {after:?}")]
    Timeout { target: String, after: Duration },

    #[error("Failed to start resolver: {reason}")]
    Spawn { reason: String },

    #[error("Resolver failed for {target}: {reason}")]
    CommandFailed { target: String, reason: String },

    #[error("Resolver returned no URL for {target}")]
    EmptyUrl { target: String },
}

/// A `scheme://path` reference into remote storage.
///
/// The path is canonicalized to start with `/` and use forward slashes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteTarget {
    scheme: String,
    path: String,
}

impl RemoteTarget {
    /// Parses a remote reference such as `115://movies/a.mkv`.
    ///
    /// Returns `None` for plain `http(s)://` URLs and for strings without
    /// a `scheme://` prefix.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let (scheme, rest) = raw.split_once("://")?;
        if scheme.is_empty() || is_http_scheme(scheme) {
            return None;
        }

        let normalized = rest.replace('\\', "/");
        let trimmed = normalized.trim_start_matches('/');
        Some(Self {
            scheme: scheme.to_string(),
            path: format!("/{trimmed}"),
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Canonical leading-slash path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Key of the redirect cache entry for this target and client.
    pub fn cache_key(&self, user_agent: &str, strip_scheme: bool) -> String {
        if strip_scheme {
            format!("{}|{user_agent}", self.path)
        } else {
            format!("{self}|{user_agent}")
        }
    }
}

impl fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:/{}", self.scheme, self.path)
    }
}

/// True for `http` and `https`, case-insensitively.
pub fn is_http_scheme(scheme: &str) -> bool {
    scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https")
}

/// True if `value` is an absolute `http(s)://` URL.
pub fn is_http_url(value: &str) -> bool {
    value
        .trim()
        .split_once("://")
        .is_some_and(|(scheme, rest)| is_http_scheme(scheme) && !rest.is_empty())
}

/// Turns a remote target into a time-limited download URL.
///
/// Implementations need not enforce a deadline; callers wrap every call
/// in one.
#[async_trait]
pub trait RemoteLinkResolver: Send + Sync {
    async fn download_url(
        &self,
        target: &RemoteTarget,
        user_agent: &str,
    ) -> Result<String, ResolveError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_canonicalizes_path() {
        let target = RemoteTarget::parse("115://movies\\2024\\a.mkv").unwrap();
        assert_eq!(target.scheme(), "115");
        assert_eq!(target.path(), "/movies/2024/a.mkv");
        assert_eq!(target.to_string(), "115://movies/2024/a.mkv");

        let target = RemoteTarget::parse("  od:///shows/b.mkv\n").unwrap();
        assert_eq!(target.path(), "/shows/b.mkv");
    }

    #[test]
    fn test_parse_rejects_http_and_plain_paths() {
        assert!(RemoteTarget::parse("https://cdn/x.mp4").is_none());
        assert!(RemoteTarget::parse("HTTP://cdn/x.mp4").is_none());
        assert!(RemoteTarget::parse("/mnt/movies/a.mkv").is_none());
        assert!(RemoteTarget::parse("://nothing").is_none());
    }

    #[test]
    fn test_cache_key_composition() {
        let target = RemoteTarget::parse("115://movies/a.mkv").unwrap();
        assert_eq!(target.cache_key("VLC/3.0", true), "/movies/a.mkv|VLC/3.0");
        assert_eq!(target.cache_key("VLC/3.0", false), "115://movies/a.mkv|VLC/3.0");
    }

    #[test]
    fn test_is_http_url() {
        assert!(is_http_url("https://x/y.mp4"));
        assert!(is_http_url("http://x"));
        assert!(!is_http_url("https://"));
        assert!(!is_http_url("115://x"));
        assert!(!is_http_url("/local/file"));
    }

    mod properties {
        use proptest::prelude::*;

        use super::*;

        fn scheme() -> impl Strategy<Value = String> {
            "[a-z0-9]{1,6}".prop_filter("not http", |s| !is_http_scheme(s))
        }

        fn segments() -> impl Strategy<Value = Vec<String>> {
            prop::collection::vec("[A-Za-z0-9]([A-Za-z0-9._ -]{0,10}[A-Za-z0-9])?", 1..5)
        }

        proptest! {
            #[test]
            fn parsed_paths_are_canonical(
                scheme in scheme(),
                segments in segments(),
                backslashes in any::<bool>(),
                leading in 0usize..3,
            ) {
                let separator = if backslashes { "\\" } else { "/" };
                let raw = format!("{scheme}://{}{}", "/".repeat(leading), segments.join(separator));
                let target = RemoteTarget::parse(&raw).unwrap();

                prop_assert_eq!(target.scheme(), scheme.as_str());
                prop_assert!(target.path().starts_with('/'));
                prop_assert!(!target.path().starts_with("//"));
                prop_assert!(!target.path().contains('\\'));
                prop_assert_eq!(target.path(), format!("/{}", segments.join("/")));
            }

            #[test]
            fn stripped_keys_ignore_scheme(
                first in scheme(),
                second in scheme(),
                segments in segments(),
                user_agent in "[A-Za-z0-9/. ]{0,16}",
            ) {
                let path = segments.join("/");
                let a = RemoteTarget::parse(&format!("{first}://{path}")).unwrap();
                let b = RemoteTarget::parse(&format!("{second}://{path}")).unwrap();

                prop_assert_eq!(a.cache_key(&user_agent, true), b.cache_key(&user_agent, true));
                if first != second {
                    prop_assert_ne!(a.cache_key(&user_agent, false), b.cache_key(&user_agent, false));
                }
            }
        }
    }
}
