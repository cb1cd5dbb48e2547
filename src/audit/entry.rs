//! Audit Events and Records
//!
//! An [`AuditEvent`] is what a calling feature submits; an [`AuditRecord`]
//! is its persisted, chained form. Each record's hash is
//! `HMAC-SHA256(secret, previous_hash || canonical(event))`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::canonical::{self, hmac_sha256_hex};
use crate::database::models::AuditRow;
use crate::error::{LedgerError, Result};

/// Well-known event types. The field is open; callers may use others.
pub mod event_types {
    pub const USER_LOGIN: &str = "user_login";
    pub const USER_LOGOUT: &str = "user_logout";
    pub const USER_FAILED_LOGIN: &str = "user_failed_login";
    pub const DATA_ACCESS: &str = "data_access";
    pub const DATA_CREATE: &str = "data_create";
    pub const DATA_UPDATE: &str = "data_update";
    pub const DATA_DELETE: &str = "data_delete";
    pub const DATA_EXPORT: &str = "data_export";
    pub const DECISION_CREATE: &str = "decision_create";
    pub const DECISION_APPROVE: &str = "decision_approve";
    pub const PROTOCOL_CREATE: &str = "protocol_create";
    pub const PROTOCOL_UPDATE: &str = "protocol_update";
    pub const PROTOCOL_FORK: &str = "protocol_fork";
    pub const EVIDENCE_CREATE: &str = "evidence_create";
    pub const EVIDENCE_UPDATE: &str = "evidence_update";
    pub const SYSTEM_CONFIG: &str = "system_config";
    pub const PERMISSION_CHANGE: &str = "permission_change";
    pub const EMERGENCY_ACCESS: &str = "emergency_access";
}

/// Audit event severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            _ => Err(format!("Unknown severity: {}", s)),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured audit event, immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_type: String,
    pub actor_id: Option<String>,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub action: String,
    /// Opaque to the ledger; serialized with sorted keys.
    pub details: Map<String, Value>,
    pub severity: Severity,
    pub session_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub context: Map<String, Value>,
    #[serde(with = "canonical::timestamp")]
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        event_type: impl Into<String>,
        resource_type: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            actor_id: None,
            resource_type: resource_type.into(),
            resource_id: None,
            action: action.into(),
            details: Map::new(),
            severity: Severity::default(),
            session_id: None,
            ip_address: None,
            user_agent: None,
            context: Map::new(),
            timestamp: canonical::now(),
        }
    }

    /// A follow-up event about an already recorded one. The original is
    /// never modified; this event carries its sequence and hash instead.
    pub fn referencing(
        original: &AuditRecord,
        event_type: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        let mut event = Self::new(event_type, original.event.resource_type.clone(), action);
        event.resource_id = original.event.resource_id.clone();
        event
            .details
            .insert("references_sequence".to_string(), Value::from(original.sequence));
        event
            .details
            .insert("references_hash".to_string(), Value::from(original.hash.clone()));
        event
    }

    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn with_resource_id(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_request_context(mut self, ip_address: impl Into<String>, user_agent: impl Into<String>) -> Self {
        self.ip_address = Some(ip_address.into());
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = canonical::normalize_timestamp(timestamp);
        self
    }

    /// Reject events that must never reach the chain.
    pub fn validate(&self) -> Result<()> {
        if self.event_type.trim().is_empty() {
            return Err(LedgerError::invalid_field("event_type", "must not be empty"));
        }
        if self.resource_type.trim().is_empty() {
            return Err(LedgerError::invalid_field("resource_type", "must not be empty"));
        }
        if self.action.trim().is_empty() {
            return Err(LedgerError::invalid_field("action", "must not be empty"));
        }
        Ok(())
    }

    /// Canonical bytes of this event, the second input of the chain hash.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        canonical::canonical_bytes(self)
    }

    pub fn summary(&self) -> String {
        format!(
            "{} {} on {}/{}",
            self.event_type,
            self.action,
            self.resource_type,
            self.resource_id.as_deref().unwrap_or("-")
        )
    }
}

/// Compute the chained hash of `event` following `previous_hash`.
pub fn chain_hash(secret: &[u8], previous_hash: &str, event: &AuditEvent) -> Result<String> {
    let canonical = event.canonical_bytes()?;
    hmac_sha256_hex(secret, &[previous_hash.as_bytes(), &canonical])
}

/// Persisted, chained form of an audit event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub sequence: u64,
    #[serde(flatten)]
    pub event: AuditEvent,
    pub previous_hash: String,
    pub hash: String,
}

impl AuditRecord {
    /// Recompute this record's hash from its own stored fields.
    pub fn recompute_hash(&self, secret: &[u8]) -> Result<String> {
        chain_hash(secret, &self.previous_hash, &self.event)
    }

    pub fn summary(&self) -> String {
        format!("#{} {} ({})", self.sequence, self.event.summary(), self.hash.get(..16).unwrap_or(&self.hash))
    }
}

impl TryFrom<AuditRow> for AuditRecord {
    type Error = LedgerError;

    fn try_from(row: AuditRow) -> Result<Self> {
        let sequence = u64::try_from(row.sequence).map_err(|_| {
            LedgerError::SerializationError(format!("Negative audit sequence {}", row.sequence))
        })?;

        Ok(AuditRecord {
            sequence,
            event: AuditEvent {
                event_type: row.event_type,
                actor_id: row.actor_id,
                resource_type: row.resource_type,
                resource_id: row.resource_id,
                action: row.action,
                details: serde_json::from_str(&row.details)?,
                severity: row
                    .severity
                    .parse()
                    .map_err(LedgerError::SerializationError)?,
                session_id: row.session_id,
                ip_address: row.ip_address,
                user_agent: row.user_agent,
                context: serde_json::from_str(&row.context)?,
                timestamp: canonical::parse_timestamp(&row.timestamp)?,
            },
            previous_hash: row.previous_hash,
            hash: row.hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::GENESIS_HASH;
    use chrono::TimeZone;

    fn sample_event() -> AuditEvent {
        AuditEvent::new(event_types::DATA_ACCESS, "patient", "view_patient_record")
            .with_actor("dr.smith")
            .with_resource_id("patient_123")
            .with_detail("fields_accessed", serde_json::json!(["diagnosis", "treatment_plan"]))
            .with_detail("access_reason", "treatment_review")
            .with_session("sess_abc123")
            .at(Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap())
    }

    #[test]
    fn test_event_defaults() {
        let event = AuditEvent::new("user_login", "user", "login");
        assert_eq!(event.severity, Severity::Medium);
        assert!(event.details.is_empty());
        assert!(event.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_blank_fields() {
        assert!(AuditEvent::new(" ", "patient", "view").validate().is_err());
        assert!(AuditEvent::new("data_access", "", "view").validate().is_err());
        assert!(AuditEvent::new("data_access", "patient", "").validate().is_err());
    }

    #[test]
    fn test_canonical_bytes_ignore_detail_insertion_order() {
        let a = AuditEvent::new("data_update", "case", "edit")
            .with_detail("b", 2)
            .with_detail("a", 1)
            .at(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let b = AuditEvent::new("data_update", "case", "edit")
            .with_detail("a", 1)
            .with_detail("b", 2)
            .at(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(a.canonical_bytes().unwrap(), b.canonical_bytes().unwrap());
    }

    #[test]
    fn test_chain_hash_depends_on_predecessor() {
        let event = sample_event();
        let first = chain_hash(b"secret", GENESIS_HASH, &event).unwrap();
        let second = chain_hash(b"secret", &first, &event).unwrap();
        assert_ne!(first, second);
        assert_eq!(first, chain_hash(b"secret", GENESIS_HASH, &event).unwrap());
    }

    #[test]
    fn test_chain_hash_covers_every_field() {
        let base = sample_event();
        let base_hash = chain_hash(b"k", GENESIS_HASH, &base).unwrap();

        let mut changed = base.clone();
        changed.severity = Severity::Critical;
        assert_ne!(base_hash, chain_hash(b"k", GENESIS_HASH, &changed).unwrap());

        let mut changed = base.clone();
        changed.ip_address = Some("10.0.0.1".to_string());
        assert_ne!(base_hash, chain_hash(b"k", GENESIS_HASH, &changed).unwrap());

        let mut changed = base;
        changed.timestamp = changed.timestamp + chrono::Duration::microseconds(1);
        assert_ne!(base_hash, chain_hash(b"k", GENESIS_HASH, &changed).unwrap());
    }

    #[test]
    fn test_referencing_event() {
        let event = sample_event();
        let record = AuditRecord {
            sequence: 7,
            hash: chain_hash(b"k", GENESIS_HASH, &event).unwrap(),
            previous_hash: GENESIS_HASH.to_string(),
            event,
        };

        let follow_up = AuditEvent::referencing(&record, event_types::DATA_UPDATE, "status_change");
        assert_eq!(follow_up.resource_id.as_deref(), Some("patient_123"));
        assert_eq!(follow_up.details["references_sequence"], 7);
        assert_eq!(follow_up.details["references_hash"], record.hash.as_str());
    }

    #[test]
    fn test_severity_round_trip() {
        for severity in [Severity::Low, Severity::Medium, Severity::High, Severity::Critical] {
            assert_eq!(severity.as_str().parse::<Severity>().unwrap(), severity);
        }
        assert!("urgent".parse::<Severity>().is_err());
        assert!(Severity::Critical > Severity::Low);
    }
}
