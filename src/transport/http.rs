//! reqwest-backed transport

use super::{HeadInfo, StatusLine};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::source::ByteStream;
use bytes::Bytes;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Body, Method, RequestBuilder, StatusCode};
use std::time::Duration;
use url::Url;

const APPEND_HEADER: &str = "X-Update-Range";

/// Default upper bound on the `CHECKAUTH` round trip
pub const CHECKAUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Talks to a real file server
///
/// Transfers carry no request timeout: long transfers are bounded by the
/// caller aborting them. Only the auth probe is time-limited.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    credentials: Option<(String, Option<String>)>,
    auth_timeout: Duration,
}

impl HttpTransport {
    pub fn new(credentials: Option<(String, Option<String>)>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("upstamp/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Network {
                message: "building HTTP client".to_string(),
                source: Some(e),
            })?;
        Ok(Self {
            client,
            credentials,
            auth_timeout: CHECKAUTH_TIMEOUT,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let credentials = config
            .username
            .clone()
            .map(|user| (user, config.password.clone()));
        Self::new(credentials)
    }

    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    fn request(&self, method: Method, url: &Url) -> RequestBuilder {
        let builder = self.client.request(method, url.clone());
        match &self.credentials {
            Some((user, password)) => builder.basic_auth(user, password.as_deref()),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<StatusLine> {
        let response = builder.send().await?;
        Ok(status_line(response.status()))
    }

    pub async fn put(&self, url: &Url, body: ByteStream, len: u64) -> Result<StatusLine> {
        tracing::trace!(url = %url, len, "PUT");
        let builder = self
            .request(Method::PUT, url)
            .header(CONTENT_LENGTH, len)
            .body(Body::wrap_stream(body));
        self.send(builder).await
    }

    pub async fn patch_append(&self, url: &Url, body: ByteStream, len: u64) -> Result<StatusLine> {
        tracing::trace!(url = %url, len, "PATCH append");
        let builder = self
            .request(Method::PATCH, url)
            .header(APPEND_HEADER, "append")
            .header(CONTENT_LENGTH, len)
            .body(Body::wrap_stream(body));
        self.send(builder).await
    }

    pub async fn head(&self, url: &Url) -> Result<HeadInfo> {
        let response = self.request(Method::HEAD, url).send().await?;
        // Response::content_length reflects the (empty) body of a HEAD reply
        let content_length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok());
        Ok(HeadInfo {
            status: status_line(response.status()),
            content_length,
        })
    }

    pub async fn post(&self, url: &Url, body: Bytes) -> Result<StatusLine> {
        let builder = self
            .request(Method::POST, url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(body);
        self.send(builder).await
    }

    pub async fn check_auth(&self, url: &Url) -> Result<StatusLine> {
        let method = Method::from_bytes(b"CHECKAUTH")
            .map_err(|e| Error::network(format!("invalid method: {}", e)))?;
        self.send(self.request(method, url).timeout(self.auth_timeout))
            .await
    }
}

fn status_line(status: StatusCode) -> StatusLine {
    StatusLine {
        code: status.as_u16(),
        reason: status.canonical_reason().unwrap_or("").to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_line_from_status_code() {
        let status = status_line(StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status.code, 503);
        assert_eq!(status.reason, "Service Unavailable");
    }

    #[test]
    fn test_from_config_credentials() {
        let config = Config {
            username: Some("alice".to_string()),
            ..Default::default()
        };
        let transport = HttpTransport::from_config(&config).unwrap();
        assert_eq!(
            transport.credentials,
            Some(("alice".to_string(), None))
        );
    }

    #[tokio::test]
    async fn test_check_auth_gives_up_on_silent_server() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            // Accept and never answer
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(socket);
        });

        let transport = HttpTransport::new(None)
            .unwrap()
            .with_auth_timeout(Duration::from_millis(200));
        let url = Url::parse(&format!("http://{}/", addr)).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), transport.check_auth(&url))
            .await
            .expect("probe must not hang");
        assert!(result.is_err());
        server.abort();
    }
}
