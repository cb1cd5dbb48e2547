//! Evidence Store
//!
//! Content-addressed, digitally signed storage of clinical evidence.

pub mod ledger;
pub mod package;
pub mod record;

pub use ledger::{
    ChainVerification, EvidenceFilter, EvidenceLedger, EvidenceSummary, ItemVerification, Receipt, Retrieved,
    Verification,
};
pub use package::{EvidencePackage, FileAttachment, PACKAGE_VERSION};
pub use record::{generate_evidence_id, EvidenceMetadata, EvidenceQuality, EvidenceRecord, EvidenceType, StudyDesign};
