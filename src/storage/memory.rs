use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{BlobHandle, BlobStore};
use crate::error::{LedgerError, Result};

/// In-process blob store for tests and ephemeral deployments.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<RwLock<HashMap<BlobHandle, Vec<u8>>>>,
    pins: Arc<RwLock<HashSet<BlobHandle>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct blobs held.
    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }

    pub async fn is_pinned(&self, handle: &BlobHandle) -> bool {
        self.pins.read().await.contains(handle)
    }

    /// Replace the bytes behind `handle` without re-addressing them,
    /// simulating corruption in the backing medium.
    pub async fn overwrite(&self, handle: &BlobHandle, data: Vec<u8>) {
        self.blobs.write().await.insert(handle.clone(), data);
    }

    /// Drop the bytes behind `handle`, simulating loss in the backing medium.
    pub async fn remove(&self, handle: &BlobHandle) -> bool {
        self.pins.write().await.remove(handle);
        self.blobs.write().await.remove(handle).is_some()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, data: &[u8]) -> Result<BlobHandle> {
        let handle = BlobHandle::for_content(data);
        self.blobs
            .write()
            .await
            .entry(handle.clone())
            .or_insert_with(|| data.to_vec());
        Ok(handle)
    }

    async fn get(&self, handle: &BlobHandle) -> Result<Vec<u8>> {
        self.blobs
            .read()
            .await
            .get(handle)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("blob", handle.as_str()))
    }

    async fn pin(&self, handle: &BlobHandle) -> Result<bool> {
        if !self.blobs.read().await.contains_key(handle) {
            return Ok(false);
        }
        self.pins.write().await.insert(handle.clone());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_identical_payloads_share_handle() {
        let store = MemoryBlobStore::new();
        let a = store.put(b"same").await.unwrap();
        let b = store.put(b"same").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_overwrite_is_visible_on_get() {
        let store = MemoryBlobStore::new();
        let handle = store.put(b"original").await.unwrap();
        store.overwrite(&handle, b"corrupted".to_vec()).await;
        assert_eq!(store.get(&handle).await.unwrap(), b"corrupted");
    }

    #[tokio::test]
    async fn test_removed_blob_is_not_found() {
        let store = MemoryBlobStore::new();
        let handle = store.put(b"lost").await.unwrap();
        assert!(store.remove(&handle).await);
        assert!(!store.remove(&handle).await);
        assert!(matches!(store.get(&handle).await, Err(LedgerError::NotFoundError(_))));
    }

    #[tokio::test]
    async fn test_pin_requires_blob() {
        let store = MemoryBlobStore::new();
        let missing = BlobHandle::for_content(b"x");
        assert!(!store.pin(&missing).await.unwrap());

        let handle = store.put(b"x").await.unwrap();
        assert!(store.pin(&handle).await.unwrap());
        assert!(store.is_pinned(&handle).await);
    }
}
