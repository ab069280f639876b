//! Streaming artifact bodies.

use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, BoxStream, Stream, StreamExt};

use crate::error::{StorageError, StorageResult};

/// Bytes of one artifact, delivered as a stream of chunks.
///
/// Artifacts have no size bound, so consumers read chunk by chunk and only
/// buffer when they opt into `collect`.
pub struct ArtifactBody {
    key: String,
    size_hint: Option<u64>,
    chunks: BoxStream<'static, StorageResult<Bytes>>,
}

impl ArtifactBody {
    /// Wrap a chunk stream.
    pub fn from_stream<S>(key: impl Into<String>, size_hint: Option<u64>, chunks: S) -> Self
    where
        S: Stream<Item = StorageResult<Bytes>> + Send + 'static,
    {
        Self {
            key: key.into(),
            size_hint,
            chunks: chunks.boxed(),
        }
    }

    /// Body whose bytes are already in memory, split into chunks of `chunk_size`.
    pub fn from_bytes(key: impl Into<String>, data: Bytes, chunk_size: usize) -> Self {
        let size = data.len() as u64;
        let chunk_size = chunk_size.max(1);
        let mut pieces = Vec::with_capacity(data.len() / chunk_size + 1);
        let mut rest = data;
        while rest.len() > chunk_size {
            pieces.push(Ok(rest.split_to(chunk_size)));
        }
        if !rest.is_empty() {
            pieces.push(Ok(rest));
        }
        Self::from_stream(key, Some(size), stream::iter(pieces))
    }

    /// Artifact key this body was opened from.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Size reported by the store, if known before reading.
    pub fn size_hint(&self) -> Option<u64> {
        self.size_hint
    }

    /// Next chunk, or `None` at end of body.
    pub async fn next_chunk(&mut self) -> Option<StorageResult<Bytes>> {
        self.chunks.next().await
    }

    /// Buffer the whole body, refusing to grow past `limit` bytes.
    pub async fn collect(mut self, limit: u64) -> StorageResult<Bytes> {
        if let Some(size) = self.size_hint {
            if size > limit {
                return Err(StorageError::TooLarge { key: self.key, limit });
            }
        }

        let mut buffer = BytesMut::new();
        while let Some(chunk) = self.next_chunk().await {
            let chunk = chunk?;
            if buffer.len() as u64 + chunk.len() as u64 > limit {
                return Err(StorageError::TooLarge { key: self.key, limit });
            }
            buffer.extend_from_slice(&chunk);
        }
        Ok(buffer.freeze())
    }
}

impl std::fmt::Debug for ArtifactBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactBody")
            .field("key", &self.key)
            .field("size_hint", &self.size_hint)
            .finish_non_exhaustive()
    }
}
