//! Resumable transfer protocol driver
//!
//! A fresh transfer is a single `PUT` of the whole source. A resumed transfer
//! first asks the server how much it holds (`HEAD`), then `PATCH`es the rest
//! with append semantics. The driver never retries on its own and never times
//! out; both are the caller's business.

use crate::error::Result;
use crate::source::{ByteStream, SourceFile};
use crate::transport::{StatusLine, Transport};
use futures::TryStreamExt;
use std::sync::Arc;
use url::Url;

/// Receives the cumulative bytes sent by the current attempt
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

/// Result of one transfer attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Complete,

    /// `reason` is the status line, or empty for an abort or a connection failure
    Failed { reason: String },
}

impl TransferOutcome {
    pub fn aborted() -> Self {
        TransferOutcome::Failed {
            reason: String::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, TransferOutcome::Complete)
    }
}

/// Map the response of an attempt to its outcome
pub fn classify(result: &Result<StatusLine>) -> TransferOutcome {
    match result {
        Ok(status) if status.is_success() => TransferOutcome::Complete,
        Ok(status) => TransferOutcome::Failed {
            reason: status.to_string(),
        },
        Err(e) => {
            tracing::debug!(error = %e, "Transfer aborted without a status");
            TransferOutcome::aborted()
        }
    }
}

/// Offset to resume from, given what the server reported
///
/// A server holding more bytes than the source has is not holding a prefix
/// of it, so the transfer starts over.
pub fn effective_offset(reported: u64, len: u64) -> u64 {
    if reported > len {
        0
    } else {
        reported
    }
}

/// Drives `PUT`/`PATCH`/`HEAD` for one target at a time
#[derive(Clone)]
pub struct TransferDriver {
    transport: Transport,
    chunk_size: usize,
}

impl TransferDriver {
    pub fn new(transport: Transport, chunk_size: usize) -> Self {
        Self {
            transport,
            chunk_size,
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Bytes the server already holds for `target`; 0 when unknown
    pub async fn discover_offset(&self, target: &Url) -> u64 {
        match self.transport.head(target).await {
            Ok(info) if info.status.code == 200 => match info.content_length {
                Some(len) => len,
                None => {
                    tracing::warn!(target = %target, "HEAD reply without Content-Length, starting over");
                    0
                }
            },
            Ok(info) => {
                tracing::debug!(target = %target, status = %info.status, "Nothing stored yet");
                0
            }
            Err(e) => {
                tracing::warn!(target = %target, error = %e, "Offset probe failed, starting over");
                0
            }
        }
    }

    /// Transfer the source from `offset`: `PUT` when 0, `PATCH` append otherwise
    pub async fn send(
        &self,
        target: &Url,
        source: &SourceFile,
        offset: u64,
        progress: ProgressFn,
    ) -> Result<StatusLine> {
        let offset = effective_offset(offset, source.len());
        let remaining = source.len() - offset;
        let body = counted(source.stream_from(offset, self.chunk_size), progress);

        if offset == 0 {
            tracing::debug!(target = %target, len = remaining, "Fresh transfer");
            self.transport.put(target, body, remaining).await
        } else {
            tracing::debug!(target = %target, offset, len = remaining, "Resuming transfer");
            self.transport.patch_append(target, body, remaining).await
        }
    }

    /// Rediscover the offset, report it through `on_offset`, then transfer the rest
    pub async fn retry(
        &self,
        target: &Url,
        source: &SourceFile,
        progress: ProgressFn,
        on_offset: impl FnOnce(u64),
    ) -> Result<StatusLine> {
        let reported = self.discover_offset(target).await;
        let offset = effective_offset(reported, source.len());
        if offset != reported {
            tracing::warn!(
                target = %target,
                reported,
                len = source.len(),
                "Server holds more bytes than the source, starting over"
            );
        }
        on_offset(offset);
        self.send(target, source, offset, progress).await
    }
}

fn counted(stream: ByteStream, progress: ProgressFn) -> ByteStream {
    let mut sent = 0u64;
    Box::pin(stream.inspect_ok(move |chunk| {
        sent += chunk.len() as u64;
        progress(sent);
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::transport::{Fault, MemoryTransport, Method};
    use std::sync::atomic::{AtomicU64, Ordering};

    fn target(path: &str) -> Url {
        Url::parse("http://server.test").unwrap().join(path).unwrap()
    }

    fn noop() -> ProgressFn {
        Arc::new(|_| {})
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(&Ok(StatusLine::new(204))), TransferOutcome::Complete);
        assert_eq!(
            classify(&Ok(StatusLine::new(503))),
            TransferOutcome::Failed {
                reason: "503 Service Unavailable".to_string()
            }
        );
        assert_eq!(
            classify(&Err(Error::network("reset"))),
            TransferOutcome::aborted()
        );
    }

    #[test]
    fn test_effective_offset() {
        assert_eq!(effective_offset(10, 100), 10);
        assert_eq!(effective_offset(100, 100), 100);
        assert_eq!(effective_offset(101, 100), 0);
    }

    #[tokio::test]
    async fn test_fresh_transfer_reports_progress() {
        let server = MemoryTransport::new();
        let driver = TransferDriver::new(server.clone().into(), 4);
        let source = SourceFile::from_bytes(&b"0123456789"[..]);

        let last = Arc::new(AtomicU64::new(0));
        let seen = last.clone();
        let progress: ProgressFn = Arc::new(move |n| seen.store(n, Ordering::SeqCst));

        let status = driver.send(&target("/f"), &source, 0, progress).await.unwrap();
        assert!(status.is_success());
        assert_eq!(last.load(Ordering::SeqCst), 10);
        assert_eq!(server.requests()[0].method, Method::Put);
    }

    #[tokio::test]
    async fn test_retry_resumes_after_interrupt() {
        let server = MemoryTransport::new();
        server.inject(Method::Put, "/f", Fault::InterruptAfter(6));
        let driver = TransferDriver::new(server.clone().into(), 4);
        let source = SourceFile::from_bytes(&b"0123456789"[..]);

        let first = driver.send(&target("/f"), &source, 0, noop()).await;
        assert_eq!(classify(&first), TransferOutcome::aborted());

        let mut offset = None;
        let status = driver
            .retry(&target("/f"), &source, noop(), |o| offset = Some(o))
            .await
            .unwrap();
        assert!(status.is_success());
        assert_eq!(offset, Some(6));

        let patch = server.requests().into_iter().last().unwrap();
        assert_eq!(patch.method, Method::Patch);
        assert_eq!(patch.body_len, 4);
        assert_eq!(server.file("/f").unwrap(), &b"0123456789"[..]);
    }

    #[tokio::test]
    async fn test_retry_with_oversized_remote_starts_over() {
        let server = MemoryTransport::new();
        server.insert_file("/f", vec![0u8; 50]);
        let driver = TransferDriver::new(server.clone().into(), 4);
        let source = SourceFile::from_bytes(&b"short"[..]);

        let mut offset = None;
        driver
            .retry(&target("/f"), &source, noop(), |o| offset = Some(o))
            .await
            .unwrap();
        assert_eq!(offset, Some(0));
        assert_eq!(server.file("/f").unwrap(), &b"short"[..]);
    }

    #[tokio::test]
    async fn test_discover_offset_missing() {
        let server = MemoryTransport::new();
        let driver = TransferDriver::new(server.into(), 4);
        assert_eq!(driver.discover_offset(&target("/none")).await, 0);
    }
}
