//! Calendar servers and block explorers

use super::Chain;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::retry::{with_retry, RetryConfig};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use bytes::Bytes;
use futures::future::join_all;
use futures::{Stream, StreamExt};
use reqwest::header::{ACCEPT, USER_AGENT};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

const OTS_MEDIA_TYPE: &str = "application/vnd.opentimestamps.v1";
const MAX_RESPONSE_LEN: usize = 10_000;

/// The external network that turns digests into timestamp proofs
#[async_trait]
pub trait ProofNetwork: Send + Sync {
    /// Submit a digest. Returns one serialized timestamp per calendar that
    /// accepted it; fails only when none did.
    async fn stamp(&self, digest: &[u8]) -> Result<Vec<Vec<u8>>>;

    /// Ask `calendar` for the upgraded timestamp of `commitment`.
    /// `None` means the commitment is not anchored yet.
    async fn upgrade(&self, calendar: &str, commitment: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Time of the block at `height`, when known
    async fn block_time(&self, _chain: Chain, _height: u64) -> Result<Option<DateTime<Utc>>> {
        Ok(None)
    }
}

/// OpenTimestamps calendar client
pub struct CalendarClient {
    client: reqwest::Client,
    calendars: Vec<Url>,
    explorer: Option<Url>,
    retry: RetryConfig,
}

#[derive(Deserialize)]
struct BlockInfo {
    timestamp: i64,
}

impl CalendarClient {
    pub fn new(
        calendars: Vec<Url>,
        explorer: Option<Url>,
        timeout: Duration,
        retry: RetryConfig,
    ) -> Result<Self> {
        if calendars.is_empty() {
            return Err(Error::config("at least one calendar is required"));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Network {
                message: "building calendar client".to_string(),
                source: Some(e),
            })?;
        Ok(Self {
            client,
            calendars,
            explorer,
            retry,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let calendars = config
            .calendars
            .iter()
            .map(|c| Url::parse(c))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let explorer = config.block_explorer.as_deref().map(Url::parse).transpose()?;
        Self::new(
            calendars,
            explorer,
            Duration::from_secs(config.proof_timeout_secs),
            RetryConfig::from(config),
        )
    }

    async fn submit(&self, calendar: &Url, digest: &[u8]) -> Result<Vec<u8>> {
        let url = endpoint(calendar, &["digest"])?;
        with_retry(&self.retry, || {
            let request = self
                .client
                .post(url.clone())
                .header(ACCEPT, OTS_MEDIA_TYPE)
                .header(USER_AGENT, concat!("upstamp/", env!("CARGO_PKG_VERSION")))
                .body(digest.to_vec());
            async move {
                let response = request.send().await?;
                let status = response.status();
                check_status(status, "digest submission")?;
                read_body(response).await
            }
        })
        .await
    }

    async fn get(&self, url: Url) -> Result<reqwest::Response> {
        with_retry(&self.retry, || {
            let request = self.client.get(url.clone()).header(ACCEPT, OTS_MEDIA_TYPE);
            async move { Ok(request.send().await?) }
        })
        .await
    }
}

#[async_trait]
impl ProofNetwork for CalendarClient {
    async fn stamp(&self, digest: &[u8]) -> Result<Vec<Vec<u8>>> {
        let attempts = self
            .calendars
            .iter()
            .map(|calendar| async move { (calendar, self.submit(calendar, digest).await) });

        let mut replies = Vec::new();
        for (calendar, result) in join_all(attempts).await {
            match result {
                Ok(reply) => {
                    tracing::debug!(calendar = %calendar, len = reply.len(), "Calendar accepted digest");
                    replies.push(reply);
                }
                Err(e) => tracing::warn!(calendar = %calendar, error = %e, "Calendar submission failed"),
            }
        }

        if replies.is_empty() {
            return Err(Error::proof("no calendar accepted the digest"));
        }
        Ok(replies)
    }

    async fn upgrade(&self, calendar: &str, commitment: &[u8]) -> Result<Option<Vec<u8>>> {
        let base = Url::parse(calendar)?;
        let commitment = hex::encode(commitment);
        let url = endpoint(&base, &["timestamp", commitment.as_str()])?;
        let response = self.get(url).await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        check_status(status, "timestamp lookup")?;
        Ok(Some(read_body(response).await?))
    }

    async fn block_time(&self, chain: Chain, height: u64) -> Result<Option<DateTime<Utc>>> {
        let Some(explorer) = &self.explorer else {
            return Ok(None);
        };
        if chain != Chain::Bitcoin {
            return Ok(None);
        }

        let height = height.to_string();
        let url = endpoint(explorer, &["block-height", height.as_str()])?;
        let response = self.get(url).await?;
        check_status(response.status(), "block height lookup")?;
        let hash = String::from_utf8(read_body(response).await?)
            .map_err(|_| Error::proof_format("block hash is not UTF-8"))?;
        let hash = hash.trim();

        let url = endpoint(explorer, &["block", hash])?;
        let response = self.get(url).await?;
        check_status(response.status(), "block lookup")?;
        let block: BlockInfo = serde_json::from_slice(&read_body(response).await?)
            .map_err(|e| Error::proof_format(format!("malformed block info: {}", e)))?;

        Ok(DateTime::from_timestamp(block.timestamp, 0))
    }
}

/// Server errors are retryable, other failures are not
fn check_status(status: StatusCode, what: &str) -> Result<()> {
    if status.is_success() {
        Ok(())
    } else if status.is_server_error() {
        Err(Error::network(format!("{} failed: {}", what, status)))
    } else {
        Err(Error::proof(format!("{} rejected: {}", what, status)))
    }
}

async fn read_body(response: reqwest::Response) -> Result<Vec<u8>> {
    let declared = response.content_length();
    read_limited(declared, response.bytes_stream(), MAX_RESPONSE_LEN).await
}

/// Collect a response body, refusing anything over `limit` bytes before
/// buffering it
async fn read_limited<S>(declared: Option<u64>, chunks: S, limit: usize) -> Result<Vec<u8>>
where
    S: Stream<Item = reqwest::Result<Bytes>>,
{
    if let Some(len) = declared.filter(|len| *len > limit as u64) {
        return Err(too_large(len));
    }

    let mut chunks = std::pin::pin!(chunks);
    let mut body = Vec::new();
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        if body.len() + chunk.len() > limit {
            return Err(too_large((body.len() + chunk.len()) as u64));
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

fn too_large(len: u64) -> Error {
    Error::proof_format(format!("response of at least {} bytes is too large", len))
}

fn endpoint(base: &Url, segments: &[&str]) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| Error::config(format!("URL cannot be a base: {}", base)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_joins_segments() {
        let base = Url::parse("https://a.pool.opentimestamps.org").unwrap();
        assert_eq!(
            endpoint(&base, &["digest"]).unwrap().as_str(),
            "https://a.pool.opentimestamps.org/digest"
        );

        let nested = Url::parse("https://blockstream.info/api/").unwrap();
        assert_eq!(
            endpoint(&nested, &["block-height", "100"]).unwrap().as_str(),
            "https://blockstream.info/api/block-height/100"
        );
    }

    #[test]
    fn test_status_classification() {
        assert!(check_status(StatusCode::OK, "x").is_ok());
        assert!(check_status(StatusCode::BAD_GATEWAY, "x")
            .unwrap_err()
            .is_retryable());
        assert!(!check_status(StatusCode::BAD_REQUEST, "x")
            .unwrap_err()
            .is_retryable());
    }

    fn chunks(parts: &[&'static [u8]]) -> impl Stream<Item = reqwest::Result<Bytes>> {
        let parts: Vec<reqwest::Result<Bytes>> =
            parts.iter().map(|p| Ok(Bytes::from_static(p))).collect();
        futures::stream::iter(parts)
    }

    #[tokio::test]
    async fn test_read_limited_collects_body() {
        let body = read_limited(Some(6), chunks(&[b"abc", b"def"]), 10).await.unwrap();
        assert_eq!(body, b"abcdef");
    }

    #[tokio::test]
    async fn test_read_limited_rejects_declared_length() {
        // Nothing is read when the header already exceeds the limit
        let err = read_limited(Some(1 << 30), chunks(&[b"abc"]), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProofFormat { .. }));
    }

    #[tokio::test]
    async fn test_read_limited_stops_oversized_stream() {
        let err = read_limited(None, chunks(&[b"0123456", b"789", b"x"]), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProofFormat { .. }));
    }

    #[test]
    fn test_block_info_decoding() {
        let block: BlockInfo =
            serde_json::from_slice(br#"{"id":"00ab","height":100,"timestamp":1231469665}"#)
                .unwrap();
        assert_eq!(block.timestamp, 1231469665);
    }

    #[test]
    fn test_requires_calendar() {
        let result = CalendarClient::new(vec![], None, Duration::from_secs(1), RetryConfig::default());
        assert!(result.is_err());
    }

    #[test]
    fn test_from_config() {
        let config = Config::default();
        assert!(CalendarClient::from_config(&config).is_ok());
    }
}
