use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use super::{BlobHandle, BlobStore};
use crate::error::{LedgerError, Result};

/// Blob store on the local filesystem.
///
/// Layout: `<root>/<first two hex chars>/<handle>` for content and
/// `<root>/pins/<handle>` as pin markers.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("pins"))
            .await
            .map_err(|e| LedgerError::BlobError(format!("Failed to create blob root {:?}: {}", root, e)))?;
        Ok(Self { root })
    }

    fn blob_path(&self, handle: &BlobHandle) -> PathBuf {
        let id = handle.as_str();
        self.root.join(&id[..2]).join(id)
    }

    fn pin_path(&self, handle: &BlobHandle) -> PathBuf {
        self.root.join("pins").join(handle.as_str())
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, data: &[u8]) -> Result<BlobHandle> {
        let handle = BlobHandle::for_content(data);
        let path = self.blob_path(&handle);

        if fs::try_exists(&path).await.unwrap_or(false) {
            debug!("Blob {} already present", handle);
            return Ok(handle);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| LedgerError::BlobError(format!("Failed to create {:?}: {}", parent, e)))?;
        }

        // Write-then-rename so readers never see a half-written blob.
        let tmp_path = path.with_extension(format!("tmp-{}", rand::random::<u32>()));
        fs::write(&tmp_path, data)
            .await
            .map_err(|e| LedgerError::BlobError(format!("Failed to write blob {}: {}", handle, e)))?;
        fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| LedgerError::BlobError(format!("Failed to commit blob {}: {}", handle, e)))?;

        debug!("Stored blob {} ({} bytes)", handle, data.len());
        Ok(handle)
    }

    async fn get(&self, handle: &BlobHandle) -> Result<Vec<u8>> {
        match fs::read(self.blob_path(handle)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(LedgerError::not_found("blob", handle.as_str())),
            Err(e) => Err(LedgerError::BlobError(format!("Failed to read blob {}: {}", handle, e))),
        }
    }

    async fn pin(&self, handle: &BlobHandle) -> Result<bool> {
        if !fs::try_exists(self.blob_path(handle)).await.unwrap_or(false) {
            return Ok(false);
        }
        fs::write(self.pin_path(handle), b"")
            .await
            .map_err(|e| LedgerError::BlobError(format!("Failed to pin blob {}: {}", handle, e)))?;
        Ok(true)
    }
}
