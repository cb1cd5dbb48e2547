//! Audit Log System
//!
//! Tamper-evident, hash-chained record of clinical actions, with range
//! verification and Merkle checkpoints.

pub mod entry;
pub mod logger;
pub mod merkle;
pub mod verify;

pub use entry::{chain_hash, event_types, AuditEvent, AuditRecord, Severity};
pub use logger::{ActorActivity, AuditFilter, AuditLogger, AuditStatistics, ExportOptions, SearchField, SortField};
pub use merkle::{merkle_proof, merkle_root, verify_proof, Checkpoint, MerkleProof};
pub use verify::{find_tampered_records, verify_records, RangeVerification};
