//! The stored, self-certifying form of an evidence record.

use serde::{Deserialize, Serialize};

use crate::canonical::{self, sha256_hex};
use crate::error::Result;
use crate::evidence::record::EvidenceRecord;
use crate::storage::BlobHandle;

pub const PACKAGE_VERSION: &str = "1.0";

/// An attached file, committed to by hash and handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttachment {
    pub content_hash: String,
    pub handle: BlobHandle,
    pub size: u64,
}

impl FileAttachment {
    pub fn describe(data: &[u8], handle: BlobHandle) -> Self {
        Self {
            content_hash: sha256_hex(data),
            handle,
            size: data.len() as u64,
        }
    }
}

/// What is written to the blob store. Its canonical bytes hash to the
/// package's `content_hash`, which in turn is what gets signed; the file
/// hash sits inside, so the signature covers the file as well.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidencePackage {
    pub version: String,
    pub record: EvidenceRecord,
    pub file: Option<FileAttachment>,
}

impl EvidencePackage {
    pub fn new(record: EvidenceRecord, file: Option<FileAttachment>) -> Self {
        Self {
            version: PACKAGE_VERSION.to_string(),
            record,
            file,
        }
    }

    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        canonical::canonical_bytes(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Bytes to store and the hash they are known by.
pub fn seal(package: &EvidencePackage) -> Result<(Vec<u8>, String)> {
    let bytes = package.canonical_bytes()?;
    let hash = sha256_hex(&bytes);
    Ok((bytes, hash))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::record::EvidenceType;

    fn record() -> EvidenceRecord {
        let mut record = EvidenceRecord::new(
            EvidenceType::LabResult,
            "CBC panel 2024-02",
            "Complete blood count for follow-up visit",
            "Central lab",
        )
        .with_content(serde_json::json!({"hb": 13.2, "wbc": 6.1}));
        record.ensure_id().unwrap();
        record
    }

    #[test]
    fn test_seal_is_deterministic_and_decodable() {
        let package = EvidencePackage::new(record(), None);
        let (bytes, hash) = seal(&package).unwrap();
        assert_eq!(seal(&package).unwrap().1, hash);

        let decoded = EvidencePackage::decode(&bytes).unwrap();
        assert_eq!(decoded, package);
        assert_eq!(seal(&decoded).unwrap().1, hash);
    }

    #[test]
    fn test_hash_commits_to_file() {
        let record = record();
        let a = FileAttachment::describe(b"scan-a", BlobHandle::for_content(b"scan-a"));
        let b = FileAttachment::describe(b"scan-b", BlobHandle::for_content(b"scan-b"));

        let hash_a = seal(&EvidencePackage::new(record.clone(), Some(a))).unwrap().1;
        let hash_b = seal(&EvidencePackage::new(record.clone(), Some(b))).unwrap().1;
        let hash_none = seal(&EvidencePackage::new(record, None)).unwrap().1;
        assert_ne!(hash_a, hash_b);
        assert_ne!(hash_a, hash_none);
    }
}
