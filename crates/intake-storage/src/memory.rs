//! In-memory artifact store.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::body::ArtifactBody;
use crate::error::{StorageError, StorageResult};
use crate::store::{ArtifactInfo, ArtifactStore};

/// Default chunk size for bodies served from memory.
const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    content_type: String,
    last_modified: DateTime<Utc>,
}

/// Artifact store kept in process memory.
///
/// Clones share the same objects.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    objects: Arc<RwLock<HashMap<String, StoredObject>>>,
    chunk_size: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            objects: Arc::new(RwLock::new(HashMap::new())),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Serve bodies in chunks of this size.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Remove an object. Returns whether it existed.
    pub fn remove(&self, key: &str) -> bool {
        self.write().remove(key).is_some()
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, key: &str) -> Option<StoredObject> {
        self.read().get(key).cloned()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, StoredObject>> {
        self.objects.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, StoredObject>> {
        self.objects.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn head(&self, key: &str) -> StorageResult<Option<ArtifactInfo>> {
        Ok(self.get(key).map(|obj| ArtifactInfo {
            key: key.to_string(),
            size: obj.data.len() as u64,
            content_type: Some(obj.content_type),
            last_modified: Some(obj.last_modified),
        }))
    }

    async fn open(&self, key: &str) -> StorageResult<ArtifactBody> {
        let obj = self.get(key).ok_or_else(|| StorageError::not_found(key))?;
        Ok(ArtifactBody::from_bytes(key, obj.data, self.chunk_size))
    }

    async fn download(&self, key: &str) -> StorageResult<Bytes> {
        self.get(key)
            .map(|obj| obj.data)
            .ok_or_else(|| StorageError::not_found(key))
    }

    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> StorageResult<()> {
        if key.is_empty() {
            return Err(StorageError::upload_failed("empty key"));
        }
        self.write().insert(
            key.to_string(),
            StoredObject {
                data,
                content_type: content_type.to_string(),
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn check_connectivity(&self) -> StorageResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_head_open() {
        let store = MemoryStore::new().with_chunk_size(1000);
        store
            .put("applications/app-1/uploads/file.pdf", Bytes::from(vec![0u8; 12_345]), "application/pdf")
            .await
            .unwrap();

        let info = store.head("applications/app-1/uploads/file.pdf").await.unwrap().unwrap();
        assert_eq!(info.size, 12_345);
        assert_eq!(info.content_type.as_deref(), Some("application/pdf"));

        let body = store.open("applications/app-1/uploads/file.pdf").await.unwrap();
        assert_eq!(body.size_hint(), Some(12_345));
        assert_eq!(body.collect(u64::MAX).await.unwrap().len(), 12_345);
    }

    #[tokio::test]
    async fn test_missing_object() {
        let store = MemoryStore::new();

        assert!(store.head("nope").await.unwrap().is_none());
        assert!(!store.exists("nope").await.unwrap());
        assert!(store.open("nope").await.unwrap_err().is_not_found());
        assert!(store.download("nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_clones_share_objects() {
        let store = MemoryStore::new();
        let other = store.clone();
        store.put("k", Bytes::from_static(b"hi"), "text/plain").await.unwrap();

        assert_eq!(other.download("k").await.unwrap(), Bytes::from_static(b"hi"));
        assert!(other.remove("k"));
        assert!(store.is_empty());
    }
}
