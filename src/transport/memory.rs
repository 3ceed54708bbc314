//! In-process file server with scriptable faults

use super::{HeadInfo, StatusLine};
use crate::error::{Error, Result};
use crate::source::ByteStream;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use url::Url;

/// Verb of a recorded request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Put,
    Patch,
    Head,
    Post,
    CheckAuth,
}

/// A request as the server saw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    /// Body bytes actually received
    pub body_len: u64,
}

/// One-shot misbehaviour for the next matching request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Answer with this status and store nothing
    Status(u16),

    /// Store the first `n` body bytes, then drop the connection
    InterruptAfter(u64),

    /// Never answer
    Stall,
}

#[derive(Default)]
struct State {
    files: HashMap<String, Vec<u8>>,
    proofs: HashMap<String, Bytes>,
    faults: Vec<(Method, String, Fault)>,
    requests: Vec<RecordedRequest>,
    auth_status: Option<u16>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    latency: Mutex<Option<Duration>>,
}

/// Emulates the server side of the upload protocol in memory
///
/// Clones share the same files.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<Inner>,
}

/// Tracks transfers in flight; decrements on drop so cancelled requests count too
struct InFlight<'a>(&'a Inner);

impl<'a> InFlight<'a> {
    fn enter(inner: &'a Inner) -> Self {
        let now = inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        inner.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(inner)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every transfer by `latency` before it is answered
    pub fn set_latency(&self, latency: Duration) {
        *self
            .inner
            .latency
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(latency);
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a fault for the next `method` request on `path`
    pub fn inject(&self, method: Method, path: &str, fault: Fault) {
        self.state().faults.push((method, path.to_string(), fault));
    }

    /// Status answered to `CHECKAUTH` (200 unless set)
    pub fn set_auth_status(&self, code: u16) {
        self.state().auth_status = Some(code);
    }

    /// Pre-populate a file
    pub fn insert_file(&self, path: &str, data: impl Into<Vec<u8>>) {
        self.state().files.insert(path.to_string(), data.into());
    }

    /// Stored content of `path`
    pub fn file(&self, path: &str) -> Option<Bytes> {
        self.state().files.get(path).map(|d| Bytes::copy_from_slice(d))
    }

    /// Proof artifact attached to `path`
    pub fn proof(&self, path: &str) -> Option<Bytes> {
        self.state().proofs.get(path).cloned()
    }

    /// All requests in arrival order
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state().requests.clone()
    }

    /// Highest number of simultaneous `PUT`/`PATCH` requests seen
    pub fn max_in_flight(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }

    /// `PUT`/`PATCH` requests currently in flight
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    fn take_fault(&self, method: Method, path: &str) -> Option<Fault> {
        let mut state = self.state();
        let index = state
            .faults
            .iter()
            .position(|(m, p, _)| *m == method && p == path)?;
        Some(state.faults.remove(index).2)
    }

    fn record(&self, method: Method, url: &Url, body_len: u64) {
        self.state().requests.push(RecordedRequest {
            method,
            path: url.path().to_string(),
            query: url.query().map(str::to_string),
            body_len,
        });
    }

    async fn delay(&self) {
        let latency = *self
            .inner
            .latency
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    pub async fn put(&self, url: &Url, body: ByteStream, len: u64) -> Result<StatusLine> {
        self.transfer(Method::Put, url, body, len).await
    }

    pub async fn patch_append(&self, url: &Url, body: ByteStream, len: u64) -> Result<StatusLine> {
        self.transfer(Method::Patch, url, body, len).await
    }

    async fn transfer(
        &self,
        method: Method,
        url: &Url,
        mut body: ByteStream,
        len: u64,
    ) -> Result<StatusLine> {
        let _guard = InFlight::enter(&self.inner);
        let path = url.path().to_string();
        let fault = self.take_fault(method, &path);

        if method == Method::Patch && !self.state().files.contains_key(&path) {
            self.record(method, url, 0);
            return Ok(StatusLine::new(404));
        }

        let limit = match fault {
            Some(Fault::InterruptAfter(n)) => Some(n),
            _ => None,
        };

        let mut received = Vec::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            received.extend_from_slice(&chunk);
            if limit.is_some_and(|n| received.len() as u64 >= n) {
                break;
            }
        }

        self.delay().await;

        match fault {
            Some(Fault::Status(code)) => {
                self.record(method, url, received.len() as u64);
                return Ok(StatusLine::new(code));
            }
            Some(Fault::Stall) => {
                self.record(method, url, received.len() as u64);
                futures::future::pending::<()>().await;
            }
            _ => {}
        }

        if let Some(n) = limit {
            received.truncate(n as usize);
            self.record(method, url, received.len() as u64);
            self.store(method, &path, received);
            return Err(Error::network("connection reset by peer"));
        }

        self.record(method, url, received.len() as u64);
        if received.len() as u64 != len {
            return Ok(StatusLine::new(400));
        }

        let code = match method {
            Method::Put if !self.state().files.contains_key(&path) => 201,
            Method::Put => 200,
            _ => 204,
        };
        self.store(method, &path, received);
        Ok(StatusLine::new(code))
    }

    fn store(&self, method: Method, path: &str, data: Vec<u8>) {
        let mut state = self.state();
        match method {
            Method::Patch => state.files.entry(path.to_string()).or_default().extend(data),
            _ => {
                state.files.insert(path.to_string(), data);
            }
        }
    }

    pub async fn head(&self, url: &Url) -> Result<HeadInfo> {
        self.record(Method::Head, url, 0);
        if let Some(Fault::Status(code)) = self.take_fault(Method::Head, url.path()) {
            return Ok(HeadInfo {
                status: StatusLine::new(code),
                content_length: None,
            });
        }
        let info = match self.state().files.get(url.path()) {
            Some(data) => HeadInfo {
                status: StatusLine::new(200),
                content_length: Some(data.len() as u64),
            },
            None => HeadInfo {
                status: StatusLine::new(404),
                content_length: None,
            },
        };
        Ok(info)
    }

    pub async fn post(&self, url: &Url, body: Bytes) -> Result<StatusLine> {
        self.record(Method::Post, url, body.len() as u64);
        if let Some(Fault::Status(code)) = self.take_fault(Method::Post, url.path()) {
            return Ok(StatusLine::new(code));
        }
        if url.query() != Some("ots") {
            return Ok(StatusLine::new(405));
        }
        let mut state = self.state();
        if !state.files.contains_key(url.path()) {
            return Ok(StatusLine::new(404));
        }
        state.proofs.insert(url.path().to_string(), body);
        Ok(StatusLine::new(201))
    }

    pub async fn check_auth(&self, url: &Url) -> Result<StatusLine> {
        self.record(Method::CheckAuth, url, 0);
        match self.take_fault(Method::CheckAuth, url.path()) {
            Some(Fault::Status(code)) => return Ok(StatusLine::new(code)),
            Some(Fault::Stall) => futures::future::pending::<()>().await,
            _ => {}
        }
        let code = self.state().auth_status.unwrap_or(200);
        Ok(StatusLine::new(code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceFile;

    fn url(path: &str) -> Url {
        Url::parse("http://server.test").unwrap().join(path).unwrap()
    }

    fn body(data: &'static [u8]) -> ByteStream {
        SourceFile::from_bytes(data).stream_from(0, 4)
    }

    #[tokio::test]
    async fn test_put_head_patch() {
        let server = MemoryTransport::new();
        let target = url("/a.txt");

        let status = server.put(&target, body(b"hello"), 5).await.unwrap();
        assert_eq!(status.code, 201);

        let head = server.head(&target).await.unwrap();
        assert_eq!(head.content_length, Some(5));

        let status = server
            .patch_append(&target, body(b" world"), 6)
            .await
            .unwrap();
        assert!(status.is_success());
        assert_eq!(server.file("/a.txt").unwrap(), &b"hello world"[..]);
    }

    #[tokio::test]
    async fn test_patch_missing_file() {
        let server = MemoryTransport::new();
        let status = server.patch_append(&url("/nope"), body(b"x"), 1).await.unwrap();
        assert_eq!(status.code, 404);
    }

    #[tokio::test]
    async fn test_interrupt_keeps_prefix() {
        let server = MemoryTransport::new();
        server.inject(Method::Put, "/big", Fault::InterruptAfter(6));

        let result = server.put(&url("/big"), body(b"0123456789"), 10).await;
        assert!(result.is_err());
        assert_eq!(server.file("/big").unwrap(), &b"012345"[..]);
        assert_eq!(server.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_status_fault_is_one_shot() {
        let server = MemoryTransport::new();
        server.inject(Method::Put, "/f", Fault::Status(503));

        let first = server.put(&url("/f"), body(b"abc"), 3).await.unwrap();
        assert_eq!(first.to_string(), "503 Service Unavailable");
        assert!(server.file("/f").is_none());

        let second = server.put(&url("/f"), body(b"abc"), 3).await.unwrap();
        assert!(second.is_success());
    }

    #[tokio::test]
    async fn test_post_proof() {
        let server = MemoryTransport::new();
        server.insert_file("/doc", b"x".to_vec());

        let target = url("/doc?ots");
        let status = server.post(&target, Bytes::from_static(b"proof")).await.unwrap();
        assert_eq!(status.code, 201);
        assert_eq!(server.proof("/doc").unwrap(), &b"proof"[..]);

        let requests = server.requests();
        assert_eq!(requests[0].method, Method::Post);
        assert_eq!(requests[0].query.as_deref(), Some("ots"));
    }

    #[tokio::test]
    async fn test_auth_status() {
        let server = MemoryTransport::new();
        let base = url("/");
        assert!(server.check_auth(&base).await.unwrap().is_success());
        server.set_auth_status(401);
        assert_eq!(server.check_auth(&base).await.unwrap().code, 401);
    }

    #[tokio::test]
    async fn test_auth_stall() {
        let server = MemoryTransport::new();
        let base = url("/files/");
        server.inject(Method::CheckAuth, "/files/", Fault::Stall);

        let stalled =
            tokio::time::timeout(Duration::from_millis(50), server.check_auth(&base)).await;
        assert!(stalled.is_err());

        // One-shot: the next probe answers
        assert_eq!(server.check_auth(&base).await.unwrap().code, 200);
    }
}
