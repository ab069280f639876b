//! Artifact store abstraction.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::body::ArtifactBody;
use crate::error::StorageResult;

/// Metadata about a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactInfo {
    /// Object key
    pub key: String,
    /// Size in bytes
    pub size: u64,
    /// Content type recorded at upload, if any
    pub content_type: Option<String>,
    /// Last modified timestamp
    pub last_modified: Option<DateTime<Utc>>,
}

/// Durable key-addressed blob storage.
///
/// The pipeline only reads; `put` exists for tooling and tests.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Look up an artifact without downloading it. `None` if absent.
    async fn head(&self, key: &str) -> StorageResult<Option<ArtifactInfo>>;

    /// Open a streaming body. Absent keys fail with `StorageError::NotFound`.
    async fn open(&self, key: &str) -> StorageResult<ArtifactBody>;

    /// Download a whole artifact into memory.
    async fn download(&self, key: &str) -> StorageResult<Bytes>;

    /// Store an artifact, replacing any existing object under `key`.
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> StorageResult<()>;

    /// Verify the backing service is reachable.
    async fn check_connectivity(&self) -> StorageResult<()>;

    /// Whether an artifact exists.
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.head(key).await?.is_some())
    }
}
