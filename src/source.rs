//! Read-only byte sources selected for upload

use crate::error::{Error, Result};
use bytes::Bytes;
use futures::{stream, Stream, TryStreamExt};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

/// A stream of body chunks
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Boxed async reader over a source
pub type SourceReader = Box<dyn AsyncRead + Send + Unpin>;

/// Exclusive handle to the content of one selected file
///
/// The size is snapshotted when the handle is created; reads never go past it,
/// so the fingerprint and the transferred bytes describe the same content even
/// if the file keeps growing on disk.
#[derive(Debug)]
pub enum SourceFile {
    /// A file on the local filesystem
    Path { path: PathBuf, len: u64 },

    /// An in-memory buffer
    Memory(Bytes),
}

impl SourceFile {
    /// Open a local file
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let metadata = fs::metadata(path)
            .await
            .map_err(|e| Error::io(format!("reading metadata of {}", path.display()), e))?;
        if !metadata.is_file() {
            return Err(Error::io(
                format!("{} is not a regular file", path.display()),
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a file"),
            ));
        }
        Ok(SourceFile::Path {
            path: path.to_path_buf(),
            len: metadata.len(),
        })
    }

    /// Wrap an in-memory buffer
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        SourceFile::Memory(data.into())
    }

    /// Size in bytes
    pub fn len(&self) -> u64 {
        match self {
            SourceFile::Path { len, .. } => *len,
            SourceFile::Memory(data) => data.len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Async reader over the whole source
    pub async fn reader(&self) -> Result<SourceReader> {
        self.reader_from(0).await
    }

    /// Async reader starting at `offset`
    pub async fn reader_from(&self, offset: u64) -> Result<SourceReader> {
        let offset = offset.min(self.len());
        match self {
            SourceFile::Path { path, len } => {
                let file = open_at(path, offset).await?;
                Ok(Box::new(file.take(len - offset)))
            }
            SourceFile::Memory(data) => Ok(Box::new(std::io::Cursor::new(
                data.slice(offset as usize..),
            ))),
        }
    }

    /// Read bytes in `[start, end)`
    pub async fn read_range(&self, start: u64, end: u64) -> Result<Bytes> {
        let end = end.min(self.len());
        if start >= end {
            return Ok(Bytes::new());
        }
        if let SourceFile::Memory(data) = self {
            return Ok(data.slice(start as usize..end as usize));
        }

        let mut buf = Vec::with_capacity((end - start) as usize);
        self.reader_from(start)
            .await?
            .take(end - start)
            .read_to_end(&mut buf)
            .await
            .map_err(|e| Error::io("reading source range", e))?;
        Ok(Bytes::from(buf))
    }

    /// Stream the bytes from `offset` to the end in chunks of at most `chunk_size`
    pub fn stream_from(&self, offset: u64, chunk_size: usize) -> ByteStream {
        let offset = offset.min(self.len());
        let chunk_size = chunk_size.max(1);

        match self {
            SourceFile::Path { path, len } => {
                let path = path.clone();
                let remaining = len - offset;
                let open = async move {
                    let file = open_at(&path, offset).await?;
                    let reader = ReaderStream::with_capacity(file.take(remaining), chunk_size);
                    Ok::<_, Error>(reader.map_err(|e| Error::io("reading source", e)))
                };
                Box::pin(stream::once(open).try_flatten())
            }
            SourceFile::Memory(data) => {
                let data = data.slice(offset as usize..);
                let chunks: Vec<Result<Bytes>> = (0..data.len())
                    .step_by(chunk_size)
                    .map(|start| Ok(data.slice(start..(start + chunk_size).min(data.len()))))
                    .collect();
                Box::pin(stream::iter(chunks))
            }
        }
    }
}

async fn open_at(path: &Path, offset: u64) -> Result<fs::File> {
    let mut file = fs::File::open(path)
        .await
        .map_err(|e| Error::io(format!("opening {}", path.display()), e))?;
    if offset > 0 {
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| Error::io("seeking source", e))?;
    }
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::io::Write;
    use tempfile::NamedTempFile;

    async fn collect(stream: ByteStream) -> Vec<Bytes> {
        stream.map(|chunk| chunk.unwrap()).collect().await
    }

    #[tokio::test]
    async fn test_memory_stream_chunks() {
        let source = SourceFile::from_bytes(&b"0123456789"[..]);
        let chunks = collect(source.stream_from(0, 4)).await;
        assert_eq!(chunks.len(), 3);
        assert_eq!(&chunks[2][..], b"89");

        let tail = collect(source.stream_from(7, 4)).await;
        assert_eq!(tail.concat(), b"789");
    }

    #[tokio::test]
    async fn test_path_stream_from_offset() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"hello resumable world").unwrap();

        let source = SourceFile::open(file.path()).await.unwrap();
        assert_eq!(source.len(), 21);

        let tail = collect(source.stream_from(6, 4)).await.concat();
        assert_eq!(tail, b"resumable world");
        assert_eq!(&source.read_range(0, 5).await.unwrap()[..], b"hello");
    }

    #[tokio::test]
    async fn test_size_is_snapshotted() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"abc").unwrap();
        let source = SourceFile::open(file.path()).await.unwrap();

        file.write_all(b"def").unwrap();
        file.flush().unwrap();

        let all = collect(source.stream_from(0, 64)).await.concat();
        assert_eq!(all, b"abc");
    }

    #[tokio::test]
    async fn test_open_missing_file() {
        assert!(SourceFile::open("/definitely/not/here.bin").await.is_err());
    }
}
