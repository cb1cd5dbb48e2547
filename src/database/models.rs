//! Row shapes of the two ledger tables. Conversion into domain types lives
//! next to the domain types themselves.

use sqlx::FromRow;

/// One row of `audit_log`. Timestamps are canonical strings and JSON
/// columns are stored as text so they read back byte-for-byte.
#[derive(Debug, Clone, FromRow)]
pub struct AuditRow {
    pub sequence: i64,
    pub event_type: String,
    pub actor_id: Option<String>,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub action: String,
    pub details: String,
    pub severity: String,
    pub session_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub context: String,
    pub timestamp: String,
    pub previous_hash: String,
    pub hash: String,
}

/// One row of the `evidence` lookup index.
#[derive(Debug, Clone, FromRow)]
pub struct EvidenceRow {
    pub evidence_id: String,
    pub evidence_type: String,
    pub title: String,
    pub description: String,
    pub source: String,
    pub created_by: Option<String>,
    pub tags: String,
    pub evidence_quality: String,
    pub content_hash: String,
    pub file_content_hash: Option<String>,
    pub storage_handle: String,
    pub file_handle: Option<String>,
    pub digital_signature: String,
    pub key_id: String,
    pub supersedes: Option<String>,
    pub created_at: String,
    pub stored_at: String,
}

pub const AUDIT_COLUMNS: &str = "sequence, event_type, actor_id, resource_type, resource_id, action, \
     details, severity, session_id, ip_address, user_agent, context, timestamp, previous_hash, hash";

pub const EVIDENCE_COLUMNS: &str = "evidence_id, evidence_type, title, description, source, created_by, \
     tags, evidence_quality, content_hash, file_content_hash, storage_handle, file_handle, \
     digital_signature, key_id, supersedes, created_at, stored_at";
