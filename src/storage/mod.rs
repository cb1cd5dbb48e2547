//! Content-Addressed Blob Storage
//!
//! Raw bytes are addressed only by the SHA-256 of their content, so storing
//! the same payload twice yields the same handle and a single copy. The
//! backend sits behind [`BlobStore`]; a filesystem and an in-memory adapter
//! ship with the crate.

pub mod filesystem;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::canonical::sha256_hex;
use crate::error::{LedgerError, Result};

pub use filesystem::FsBlobStore;
pub use memory::MemoryBlobStore;

/// Content address of a stored blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobHandle(String);

impl BlobHandle {
    /// Handle for `data` as any SHA-256 addressed store would assign it.
    pub fn for_content(data: &[u8]) -> Self {
        Self(sha256_hex(data))
    }

    /// Accept a handle read back from storage, rejecting anything that is
    /// not 64 lowercase hex characters.
    pub fn parse(value: &str) -> Result<Self> {
        let well_formed = value.len() == 64
            && value
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if well_formed {
            Ok(Self(value.to_string()))
        } else {
            Err(LedgerError::invalid_field("blob handle", value))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Backend-agnostic content-addressed store.
///
/// Implementations must make `put` idempotent: the handle depends only on
/// the bytes, so a retried call after a timeout is always safe.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, data: &[u8]) -> Result<BlobHandle>;

    /// Return the stored bytes exactly as held by the backend, without
    /// checking them against the handle.
    async fn get(&self, handle: &BlobHandle) -> Result<Vec<u8>>;

    /// Protect a blob from garbage collection. `false` when the backend
    /// does not hold the blob.
    async fn pin(&self, handle: &BlobHandle) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_for_content_is_sha256() {
        let handle = BlobHandle::for_content(b"hello");
        assert_eq!(
            handle.as_str(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_parse_rejects_paths() {
        assert!(BlobHandle::parse("../../etc/passwd").is_err());
        assert!(BlobHandle::parse(&"A".repeat(64)).is_err());
        assert!(BlobHandle::parse(&"a".repeat(64)).is_ok());
    }
}
