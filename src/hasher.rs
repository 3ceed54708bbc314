//! Chunked content fingerprinting
//!
//! Sources are read strictly in order, one chunk at a time, and every chunk is
//! fed into a single incremental digest context. The fingerprint therefore
//! depends only on the content, never on the chunk size, and peak memory is
//! bounded by one chunk buffer.

use crate::error::{Error, Result};
use crate::source::SourceFile;
use crate::types::{Fingerprint, HashAlgorithm};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Default hashing chunk size (64KB)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Incremental digest state
enum DigestContext {
    Sha256(Sha256),
    Blake3(Box<blake3::Hasher>),
}

impl DigestContext {
    fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Sha256 => DigestContext::Sha256(Sha256::new()),
            HashAlgorithm::Blake3 => DigestContext::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    fn update(&mut self, chunk: &[u8]) {
        match self {
            DigestContext::Sha256(h) => h.update(chunk),
            DigestContext::Blake3(h) => {
                h.update(chunk);
            }
        }
    }

    fn finalize(self) -> Vec<u8> {
        match self {
            DigestContext::Sha256(h) => h.finalize().to_vec(),
            DigestContext::Blake3(h) => h.finalize().as_bytes().to_vec(),
        }
    }
}

/// Fingerprint a source chunk by chunk
///
/// `on_progress` receives the fraction of bytes read after every chunk. Any
/// read failure aborts the whole operation; no partial fingerprint is returned.
pub async fn hash_source<F>(
    source: &SourceFile,
    algorithm: HashAlgorithm,
    chunk_size: usize,
    mut on_progress: F,
) -> Result<Fingerprint>
where
    F: FnMut(f64),
{
    if chunk_size == 0 {
        return Err(Error::config("hash chunk size must be positive"));
    }

    let total = source.len();
    let mut reader = source.reader().await?;
    let mut context = DigestContext::new(algorithm);
    let mut buffer = vec![0u8; chunk_size];
    let mut read_total = 0u64;

    loop {
        let filled = fill_chunk(&mut reader, &mut buffer).await.map_err(|e| {
            Error::io(format!("reading chunk at offset {}", read_total), e)
        })?;
        if filled == 0 {
            break;
        }

        context.update(&buffer[..filled]);
        read_total += filled as u64;
        on_progress(fraction(read_total, total));

        if filled < chunk_size {
            break;
        }
    }

    if read_total != total {
        return Err(Error::io(
            format!("source ended after {} of {} bytes", read_total, total),
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "source truncated"),
        ));
    }

    if total == 0 {
        on_progress(1.0);
    }

    let fingerprint = Fingerprint::new(algorithm, context.finalize());
    tracing::debug!(%algorithm, bytes = total, fingerprint = %fingerprint, "Hashed source");
    Ok(fingerprint)
}

/// Fingerprint an in-memory buffer
pub fn hash_bytes(data: &[u8], algorithm: HashAlgorithm) -> Fingerprint {
    let mut context = DigestContext::new(algorithm);
    context.update(data);
    Fingerprint::new(algorithm, context.finalize())
}

/// Read until `buf` is full or the reader is exhausted
async fn fill_chunk<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn fraction(done: u64, total: u64) -> f64 {
    if total == 0 {
        1.0
    } else {
        (done as f64 / total as f64).min(1.0)
    }
}
