#![allow(dead_code)]

use clinical_ledger::audit::{AuditEvent, AuditLogger};
use clinical_ledger::crypto::KeyManager;
use clinical_ledger::database::Database;
use clinical_ledger::evidence::{EvidenceLedger, EvidenceRecord, EvidenceType};
use clinical_ledger::storage::MemoryBlobStore;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const TEST_SECRET: &[u8] = b"integration-test-audit-secret";

/// Setup an in-memory SQLite database for testing
pub async fn setup_test_db() -> Database {
    Database::new_in_memory().await.expect("Failed to create test database")
}

/// File-backed database with the pooled, multi-connection settings used in
/// production. The temp dir must outlive the database.
pub async fn setup_file_db() -> (Database, TempDir) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let url = format!("sqlite://{}", dir.path().join("ledger.db").display());
    let db = Database::new(&url).await.expect("Failed to open file database");
    db.run_migrations().await.expect("Failed to run migrations");
    (db, dir)
}

pub async fn setup_audit_logger() -> AuditLogger {
    AuditLogger::new(setup_test_db().await, TEST_SECRET.to_vec()).expect("Failed to create audit logger")
}

/// Everything an evidence test needs. The temp dir holds the key file and
/// must outlive the ledger.
pub struct EvidenceFixture {
    pub ledger: EvidenceLedger,
    pub blobs: MemoryBlobStore,
    pub keys: Arc<KeyManager>,
    pub db: Database,
    pub dir: TempDir,
}

pub async fn setup_evidence_ledger() -> EvidenceFixture {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let keys = Arc::new(
        KeyManager::load_or_create(dir.path().join("evidence-signing.json")).expect("Failed to create key"),
    );
    let blobs = MemoryBlobStore::new();
    let db = setup_test_db().await;
    let ledger = EvidenceLedger::new(db.clone(), Arc::new(blobs.clone()), keys.clone(), Duration::from_secs(5));

    EvidenceFixture {
        ledger,
        blobs,
        keys,
        db,
        dir,
    }
}

/// Create a test audit event
pub fn create_test_event(i: usize) -> AuditEvent {
    AuditEvent::new("data_access", "patient", "view_patient_record")
        .with_actor(format!("clinician{}", i % 3))
        .with_resource_id(format!("patient_{}", i))
        .with_detail("request", i as u64)
}

/// Create a test evidence record
pub fn create_test_evidence(title: &str) -> EvidenceRecord {
    EvidenceRecord::new(
        EvidenceType::LabResult,
        title,
        "Lab result attached to the follow-up visit",
        "Central laboratory",
    )
    .with_creator("lab.tech")
    .with_tags(["hematology"])
    .with_content(serde_json::json!({"hb": 12.9, "unit": "g/dL"}))
}
