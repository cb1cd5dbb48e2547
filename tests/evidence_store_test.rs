use async_trait::async_trait;
use clinical_ledger::crypto::KeyManager;
use clinical_ledger::error::{LedgerError, Result};
use clinical_ledger::evidence::{EvidenceLedger, EvidenceRecord};
use clinical_ledger::storage::{BlobHandle, BlobStore, MemoryBlobStore};
use std::sync::Arc;
use std::time::Duration;

mod common;
use common::*;

/// Blob store that can stall writes and refuses to pin.
struct FlakyBlobStore {
    inner: MemoryBlobStore,
    put_delay: Duration,
}

#[async_trait]
impl BlobStore for FlakyBlobStore {
    async fn put(&self, data: &[u8]) -> Result<BlobHandle> {
        tokio::time::sleep(self.put_delay).await;
        self.inner.put(data).await
    }

    async fn get(&self, handle: &BlobHandle) -> Result<Vec<u8>> {
        self.inner.get(handle).await
    }

    async fn pin(&self, _handle: &BlobHandle) -> Result<bool> {
        Err(LedgerError::BlobError("pinning service unavailable".to_string()))
    }
}

fn flip_one_bit(signature: &str) -> String {
    let (key_id, sig_hex) = signature.split_once(':').unwrap();
    let mut bytes = hex::decode(sig_hex).unwrap();
    bytes[10] ^= 0x01;
    format!("{}:{}", key_id, hex::encode(bytes))
}

#[tokio::test]
async fn test_store_retrieve_round_trip() {
    let fixture = setup_evidence_ledger().await;
    let record = create_test_evidence("Hemoglobin follow-up");
    let content = record.content.clone();
    let file = b"%PDF-1.7 lab report".to_vec();

    let receipt = fixture.ledger.store(record, Some(&file)).await.unwrap();
    let retrieved = fixture.ledger.retrieve(&receipt.evidence_id).await.unwrap();

    assert!(retrieved.verification.hash_valid);
    assert!(retrieved.verification.signature_valid);
    assert_eq!(retrieved.verification.file_hash_valid, Some(true));
    assert_eq!(retrieved.file.unwrap(), file);

    let stored = retrieved.record.unwrap();
    assert_eq!(stored.content, content);
    assert_eq!(
        serde_json::to_vec(&stored.content).unwrap(),
        serde_json::to_vec(&content).unwrap()
    );
    assert_eq!(retrieved.receipt, receipt);
}

#[tokio::test]
async fn test_signature_bit_flip_is_independent_of_hash() {
    let fixture = setup_evidence_ledger().await;
    let receipt = fixture
        .ledger
        .store(create_test_evidence("Potassium panel"), None)
        .await
        .unwrap();

    sqlx::query("UPDATE evidence SET digital_signature = ? WHERE evidence_id = ?")
        .bind(flip_one_bit(&receipt.signature))
        .bind(&receipt.evidence_id)
        .execute(fixture.db.pool())
        .await
        .unwrap();

    let retrieved = fixture.ledger.retrieve(&receipt.evidence_id).await.unwrap();
    assert!(retrieved.verification.hash_valid);
    assert!(!retrieved.verification.signature_valid);
    assert!(retrieved.record.is_some());
}

#[tokio::test]
async fn test_corrupted_package_fails_hash_check() {
    let fixture = setup_evidence_ledger().await;
    let receipt = fixture
        .ledger
        .store(create_test_evidence("Sodium panel"), None)
        .await
        .unwrap();

    let handle = BlobHandle::parse(&receipt.storage_handle).unwrap();
    fixture.blobs.overwrite(&handle, b"not a package".to_vec()).await;

    let retrieved = fixture.ledger.retrieve(&receipt.evidence_id).await.unwrap();
    assert!(!retrieved.verification.hash_valid);
    assert!(retrieved.verification.signature_valid);
    assert!(retrieved.record.is_none());
}

#[tokio::test]
async fn test_corrupted_file_fails_hash_check() {
    let fixture = setup_evidence_ledger().await;
    let receipt = fixture
        .ledger
        .store(create_test_evidence("Biopsy slide"), Some(b"slide image"))
        .await
        .unwrap();

    let handle = BlobHandle::parse(receipt.file_handle.as_deref().unwrap()).unwrap();
    fixture.blobs.overwrite(&handle, b"slide imagf".to_vec()).await;

    let retrieved = fixture.ledger.retrieve(&receipt.evidence_id).await.unwrap();
    assert_eq!(retrieved.verification.file_hash_valid, Some(false));
    assert!(!retrieved.verification.hash_valid);
    assert!(retrieved.verification.signature_valid);
}

#[tokio::test]
async fn test_identical_payloads_share_blob_handle() {
    let fixture = setup_evidence_ledger().await;
    let scan = b"identical scan bytes".to_vec();

    let first = fixture
        .ledger
        .store(create_test_evidence("Chest X-ray"), Some(&scan))
        .await
        .unwrap();
    let second = fixture
        .ledger
        .store(create_test_evidence("Chest X-ray"), Some(&scan))
        .await
        .unwrap();

    assert_ne!(first.evidence_id, second.evidence_id);
    assert_eq!(first.file_handle, second.file_handle);
    assert_eq!(first.file_content_hash, second.file_content_hash);
    // One shared file blob plus one package blob per record.
    assert_eq!(fixture.blobs.len().await, 3);
}

#[tokio::test]
async fn test_resubmission_returns_prior_receipt() {
    let fixture = setup_evidence_ledger().await;
    let mut record = create_test_evidence("Troponin series");
    record.ensure_id().unwrap();

    let first = fixture.ledger.store(record.clone(), None).await.unwrap();
    let again = fixture.ledger.store(record.clone(), None).await.unwrap();
    assert_eq!(first, again);

    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM evidence")
        .fetch_one(fixture.db.pool())
        .await
        .unwrap();
    assert_eq!(rows, 1);

    // Same id, different content.
    record.description = "A different description of the series".to_string();
    assert!(matches!(
        fixture.ledger.store(record, None).await,
        Err(LedgerError::ValidationError(_))
    ));
}

#[tokio::test]
async fn test_retried_store_is_idempotent() {
    let fixture = setup_evidence_ledger().await;
    let record = create_test_evidence("Lactate trend");
    let file = b"lactate export".to_vec();

    // No id assigned up front: a retry after an unknown outcome resubmits as-is.
    let first = fixture.ledger.store(record.clone(), Some(&file)).await.unwrap();
    let retry = fixture.ledger.store(record.clone(), Some(&file)).await.unwrap();
    assert_eq!(first, retry);

    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM evidence")
        .fetch_one(fixture.db.pool())
        .await
        .unwrap();
    assert_eq!(rows, 1);
}

#[tokio::test]
async fn test_lost_package_blob_is_flagged() {
    let fixture = setup_evidence_ledger().await;
    let receipt = fixture
        .ledger
        .store(create_test_evidence("Creatinine clearance"), Some(b"clearance chart"))
        .await
        .unwrap();

    let handle = BlobHandle::parse(&receipt.storage_handle).unwrap();
    assert!(fixture.blobs.remove(&handle).await);

    let retrieved = fixture.ledger.retrieve(&receipt.evidence_id).await.unwrap();
    assert!(!retrieved.verification.hash_valid);
    assert!(retrieved.verification.signature_valid);
    assert!(retrieved.record.is_none());
    assert_eq!(retrieved.verification.file_hash_valid, Some(true));

    // Only an unknown id is NotFound.
    assert!(matches!(
        fixture.ledger.retrieve("EVD_unknown").await,
        Err(LedgerError::NotFoundError(_))
    ));
}

#[tokio::test]
async fn test_lost_file_blob_is_flagged() {
    let fixture = setup_evidence_ledger().await;
    let receipt = fixture
        .ledger
        .store(create_test_evidence("Echocardiogram"), Some(b"echo loop"))
        .await
        .unwrap();

    let handle = BlobHandle::parse(receipt.file_handle.as_deref().unwrap()).unwrap();
    assert!(fixture.blobs.remove(&handle).await);

    let retrieved = fixture.ledger.retrieve(&receipt.evidence_id).await.unwrap();
    assert!(retrieved.file.is_none());
    assert_eq!(retrieved.verification.file_hash_valid, Some(false));
    assert!(!retrieved.verification.hash_valid);
    assert!(retrieved.verification.signature_valid);
    assert!(retrieved.record.is_some());
}

#[tokio::test]
async fn test_rotation_keeps_old_signatures_valid() {
    let fixture = setup_evidence_ledger().await;
    let before = fixture
        .ledger
        .store(create_test_evidence("Before rotation"), None)
        .await
        .unwrap();

    let new_key = fixture.keys.rotate().unwrap();
    let after = fixture
        .ledger
        .store(create_test_evidence("After rotation"), None)
        .await
        .unwrap();

    assert_ne!(before.key_id, after.key_id);
    assert_eq!(after.key_id, new_key);

    let result = fixture
        .ledger
        .verify_chain(&[before.evidence_id.clone(), after.evidence_id.clone()])
        .await;
    assert!(result.overall_valid);

    // A reloaded key file knows both keys.
    let reloaded = KeyManager::load_or_create(fixture.dir.path().join("evidence-signing.json")).unwrap();
    assert!(reloaded.verify(before.content_hash.as_bytes(), &before.signature));
}

#[tokio::test]
async fn test_verify_only_keys_can_retrieve_but_not_store() {
    let fixture = setup_evidence_ledger().await;
    let receipt = fixture
        .ledger
        .store(create_test_evidence("Culture result"), None)
        .await
        .unwrap();

    let verify_only = EvidenceLedger::new(
        fixture.db.clone(),
        Arc::new(fixture.blobs.clone()),
        Arc::new(KeyManager::verify_only(fixture.keys.keyring())),
        Duration::from_secs(5),
    );

    let retrieved = verify_only.retrieve(&receipt.evidence_id).await.unwrap();
    assert!(retrieved.verification.is_valid());

    let result = verify_only.store(create_test_evidence("Another culture"), None).await;
    assert!(matches!(result, Err(LedgerError::KeyStoreError(_))));
}

#[tokio::test]
async fn test_blob_timeout_is_retryable() {
    let fixture = setup_evidence_ledger().await;
    let slow = EvidenceLedger::new(
        fixture.db.clone(),
        Arc::new(FlakyBlobStore {
            inner: MemoryBlobStore::new(),
            put_delay: Duration::from_millis(200),
        }),
        fixture.keys.clone(),
        Duration::from_millis(20),
    );

    let err = slow
        .store(create_test_evidence("Slow upload"), Some(b"large file"))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::TimeoutError(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_pin_failure_does_not_fail_store() {
    let fixture = setup_evidence_ledger().await;
    let ledger = EvidenceLedger::new(
        fixture.db.clone(),
        Arc::new(FlakyBlobStore {
            inner: MemoryBlobStore::new(),
            put_delay: Duration::ZERO,
        }),
        fixture.keys.clone(),
        Duration::from_secs(5),
    );

    let receipt = ledger.store(create_test_evidence("Unpinned"), None).await.unwrap();
    assert!(ledger.retrieve(&receipt.evidence_id).await.unwrap().verification.is_valid());
}

#[tokio::test]
async fn test_supersede_preserves_original() {
    let fixture = setup_evidence_ledger().await;
    let original = fixture
        .ledger
        .store(create_test_evidence("Ferritin level"), None)
        .await
        .unwrap();

    let correction: EvidenceRecord = create_test_evidence("Ferritin level (corrected)");
    let corrected = fixture
        .ledger
        .supersede(&original.evidence_id, correction, None)
        .await
        .unwrap();

    let retrieved = fixture.ledger.retrieve(&corrected.evidence_id).await.unwrap();
    assert_eq!(
        retrieved.record.unwrap().supersedes.as_deref(),
        Some(original.evidence_id.as_str())
    );
    assert_eq!(
        fixture.ledger.lineage(&corrected.evidence_id).await.unwrap(),
        vec![corrected.evidence_id.clone(), original.evidence_id.clone()]
    );
    assert!(fixture.ledger.retrieve(&original.evidence_id).await.unwrap().verification.is_valid());
}
