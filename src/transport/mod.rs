//! HTTP verbs spoken to the file server
//!
//! - `PUT <target>` with the whole body starts a fresh transfer
//! - `PATCH <target>` with `X-Update-Range: append` continues one
//! - `HEAD <target>` reports how many bytes the server already holds
//! - `POST <target>?ots` stores a proof artifact next to the file
//! - `CHECKAUTH <base>` probes whether the session is authenticated

pub mod http;
pub mod memory;

pub use http::HttpTransport;
pub use memory::{Fault, MemoryTransport, Method, RecordedRequest};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::source::ByteStream;
use bytes::Bytes;
use std::fmt;
use url::Url;

/// Status code and reason phrase of a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub code: u16,
    pub reason: String,
}

impl StatusLine {
    /// Status with its canonical reason phrase
    pub fn new(code: u16) -> Self {
        let reason = reqwest::StatusCode::from_u16(code)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("");
        Self {
            code,
            reason: reason.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

impl fmt::Display for StatusLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} {}", self.code, self.reason)
        }
    }
}

/// Response to a `HEAD` probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadInfo {
    pub status: StatusLine,
    pub content_length: Option<u64>,
}

/// Transport enum for unified access to the server emulator and real HTTP
#[derive(Clone)]
pub enum Transport {
    Http(HttpTransport),
    Memory(MemoryTransport),
}

impl Transport {
    /// HTTP transport using the configured credentials
    pub fn http(config: &Config) -> Result<Self> {
        Ok(Transport::Http(HttpTransport::from_config(config)?))
    }

    /// Fresh in-process server
    pub fn memory() -> Self {
        Transport::Memory(MemoryTransport::new())
    }

    /// Name of this transport (for logging)
    pub fn name(&self) -> &'static str {
        match self {
            Transport::Http(_) => "http",
            Transport::Memory(_) => "memory",
        }
    }

    /// Fresh transfer: replace the target with `body`
    pub async fn put(&self, url: &Url, body: ByteStream, len: u64) -> Result<StatusLine> {
        match self {
            Transport::Http(t) => t.put(url, body, len).await,
            Transport::Memory(t) => t.put(url, body, len).await,
        }
    }

    /// Resumed transfer: append `body` to the target
    pub async fn patch_append(&self, url: &Url, body: ByteStream, len: u64) -> Result<StatusLine> {
        match self {
            Transport::Http(t) => t.patch_append(url, body, len).await,
            Transport::Memory(t) => t.patch_append(url, body, len).await,
        }
    }

    /// Metadata probe
    pub async fn head(&self, url: &Url) -> Result<HeadInfo> {
        match self {
            Transport::Http(t) => t.head(url).await,
            Transport::Memory(t) => t.head(url).await,
        }
    }

    /// Small buffered upload
    pub async fn post(&self, url: &Url, body: Bytes) -> Result<StatusLine> {
        match self {
            Transport::Http(t) => t.post(url, body).await,
            Transport::Memory(t) => t.post(url, body).await,
        }
    }

    /// Authentication probe
    pub async fn check_auth(&self, url: &Url) -> Result<StatusLine> {
        match self {
            Transport::Http(t) => t.check_auth(url).await,
            Transport::Memory(t) => t.check_auth(url).await,
        }
    }
}

impl From<MemoryTransport> for Transport {
    fn from(t: MemoryTransport) -> Self {
        Transport::Memory(t)
    }
}

impl From<HttpTransport> for Transport {
    fn from(t: HttpTransport) -> Self {
        Transport::Http(t)
    }
}

/// Target URL for a display name below `base`
///
/// Each `/`-separated segment is percent-encoded on its own; empty segments
/// are dropped and `.` or `..` are refused.
pub fn target_url(base: &Url, display_name: &str) -> Result<Url> {
    let invalid = |reason: &str| Error::InvalidTarget {
        name: display_name.to_string(),
        reason: reason.to_string(),
    };

    let segments: Vec<&str> = display_name.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return Err(invalid("empty name"));
    }
    if segments.iter().any(|s| *s == "." || *s == "..") {
        return Err(invalid("relative path segment"));
    }

    let mut url = base.clone();
    url.set_query(None);
    url.set_fragment(None);
    url.path_segments_mut()
        .map_err(|_| invalid("server URL cannot be a base"))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// `url` with its query replaced by `query`
pub fn with_query(url: &Url, query: &str) -> Url {
    let mut url = url.clone();
    url.set_query(Some(query));
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_line() {
        let status = StatusLine::new(503);
        assert_eq!(status.to_string(), "503 Service Unavailable");
        assert!(!status.is_success());
        assert!(StatusLine::new(201).is_success());
        assert_eq!(StatusLine::new(599).to_string(), "599");
    }

    #[test]
    fn test_target_url() {
        let base = Url::parse("https://files.example/dav/").unwrap();
        let url = target_url(&base, "photos/2024/a b.jpg").unwrap();
        assert_eq!(url.as_str(), "https://files.example/dav/photos/2024/a%20b.jpg");

        let bare = Url::parse("https://files.example").unwrap();
        assert_eq!(
            target_url(&bare, "/x//y").unwrap().as_str(),
            "https://files.example/x/y"
        );
    }

    #[test]
    fn test_target_url_rejects() {
        let base = Url::parse("https://files.example/").unwrap();
        assert!(target_url(&base, "").is_err());
        assert!(target_url(&base, "a/../b").is_err());
        assert!(matches!(
            target_url(&base, "./x"),
            Err(Error::InvalidTarget { .. })
        ));
    }

    #[test]
    fn test_with_query() {
        let url = Url::parse("https://files.example/a.txt").unwrap();
        assert_eq!(with_query(&url, "ots").as_str(), "https://files.example/a.txt?ots");
    }
}
