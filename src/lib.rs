pub mod audit;
pub mod canonical;
pub mod config;
pub mod crypto;
pub mod database;
pub mod error;
pub mod evidence;
pub mod storage;

pub use audit::{AuditEvent, AuditLogger, AuditRecord, Severity};
pub use config::AppConfig;
pub use database::Database;
pub use error::{LedgerError, Result};
pub use evidence::{EvidenceLedger, EvidenceRecord, Receipt};
