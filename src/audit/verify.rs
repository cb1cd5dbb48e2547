//! Audit Chain Verification
//!
//! Recomputes the hash chain over a range of records and reports where, if
//! anywhere, it stops being trustworthy. Tampering is an expected outcome
//! and is reported through [`RangeVerification`], never as an error.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::audit::entry::{chain_hash, AuditRecord};
use crate::audit::logger::AuditLogger;
use crate::canonical::GENESIS_HASH;
use crate::error::Result;

/// Outcome of checking the half-open range `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RangeVerification {
    pub valid: bool,
    pub start: u64,
    /// Exclusive end after clamping to the chain tail.
    pub end: u64,
    pub records_checked: u64,
    /// First sequence id that cannot be trusted.
    pub first_invalid: Option<u64>,
    /// Positions from `first_invalid` to `end`, all of which are untrusted.
    pub untrusted_count: u64,
    pub reason: Option<String>,
}

impl RangeVerification {
    fn passed(start: u64, end: u64, records_checked: u64) -> Self {
        Self {
            valid: true,
            start,
            end,
            records_checked,
            first_invalid: None,
            untrusted_count: 0,
            reason: None,
        }
    }

    fn failed(start: u64, end: u64, records_checked: u64, at: u64, reason: String) -> Self {
        Self {
            valid: false,
            start,
            end,
            records_checked,
            first_invalid: Some(at),
            untrusted_count: end.saturating_sub(at),
            reason: Some(reason),
        }
    }

    pub fn summary(&self) -> String {
        match (self.first_invalid, &self.reason) {
            (Some(at), Some(reason)) => format!(
                "INVALID: records [{}, {}) untrusted from #{} ({} records): {}",
                self.start, self.end, at, self.untrusted_count, reason
            ),
            _ => format!(
                "VALID: {} records in [{}, {})",
                self.records_checked, self.start, self.end
            ),
        }
    }
}

/// Check `records`, which must be the rows of `[start, end)` in ascending
/// order, against `anchor`, the hash preceding `start`.
///
/// Each record is checked for its position (gaps), its stored
/// `previous_hash` and its recomputed hash; the first failure taints every
/// later position in the range.
pub fn verify_records(
    secret: &[u8],
    anchor: &str,
    start: u64,
    end: u64,
    records: &[AuditRecord],
) -> RangeVerification {
    let mut expected_previous = anchor.to_string();
    let mut checked = 0u64;

    for (offset, record) in records.iter().enumerate() {
        let position = start + offset as u64;
        checked += 1;

        if record.sequence != position {
            return RangeVerification::failed(
                start,
                end,
                checked,
                position,
                format!("sequence gap: expected #{}, found #{}", position, record.sequence),
            );
        }

        if record.previous_hash != expected_previous {
            return RangeVerification::failed(
                start,
                end,
                checked,
                position,
                format!("record #{} does not link to its predecessor", position),
            );
        }

        match chain_hash(secret, &expected_previous, &record.event) {
            Ok(hash) if hash == record.hash => {}
            Ok(_) => {
                return RangeVerification::failed(
                    start,
                    end,
                    checked,
                    position,
                    format!("record #{} hash does not match its contents", position),
                );
            }
            Err(e) => {
                return RangeVerification::failed(
                    start,
                    end,
                    checked,
                    position,
                    format!("record #{} could not be hashed: {}", position, e),
                );
            }
        }

        debug!("Verified audit record #{}", position);
        expected_previous = record.hash.clone();
    }

    let expected_len = end.saturating_sub(start);
    if checked < expected_len {
        let missing = start + checked;
        return RangeVerification::failed(start, end, checked, missing, format!("record #{} is missing", missing));
    }

    RangeVerification::passed(start, end, checked)
}

/// Sequence ids of records whose own hash does not match their contents,
/// independent of chain position. Useful after a failed range check to see
/// which rows were edited rather than merely follow an edited row.
pub fn find_tampered_records(secret: &[u8], records: &[AuditRecord]) -> Vec<u64> {
    records
        .iter()
        .filter(|record| match record.recompute_hash(secret) {
            Ok(hash) => hash != record.hash,
            Err(_) => true,
        })
        .map(|record| record.sequence)
        .collect()
}

impl AuditLogger {
    /// Verify the chain over `[start, end)`. `end` past the tail is clamped.
    ///
    /// May run concurrently with appends; a result racing a write reflects
    /// the chain as it was read and should be re-run for a definitive answer.
    pub async fn verify_range(&self, start: u64, end: u64) -> Result<RangeVerification> {
        let end = end.min(self.next_sequence().await?);
        if start >= end {
            return Ok(RangeVerification::passed(start, start.max(end), 0));
        }

        let anchor = if start == 0 {
            GENESIS_HASH.to_string()
        } else {
            match self.stored_hash(start - 1).await? {
                Some(hash) => hash,
                None => {
                    let result = RangeVerification::failed(
                        start,
                        end,
                        0,
                        start,
                        format!("anchor record #{} is missing", start - 1),
                    );
                    warn!("Audit chain verification failed: {}", result.summary());
                    return Ok(result);
                }
            }
        };

        let rows = self.fetch_rows(start, end).await?;

        // Rows that no longer decode end the checkable prefix.
        let mut records = Vec::with_capacity(rows.len());
        let mut undecodable = None;
        for row in rows {
            let sequence = row.sequence;
            match AuditRecord::try_from(row) {
                Ok(record) => records.push(record),
                Err(e) => {
                    undecodable = Some((sequence, e));
                    break;
                }
            }
        }

        let mut result = verify_records(&self.secret, &anchor, start, end, &records);

        if let Some((sequence, e)) = undecodable {
            let decoded_ok = records.len() as u64;
            // Only report the decode failure if nothing earlier already failed.
            if result.first_invalid.map_or(true, |at| at >= start + decoded_ok) {
                let position = (sequence.max(0) as u64).min(start + decoded_ok);
                result = RangeVerification::failed(
                    start,
                    end,
                    decoded_ok + 1,
                    position,
                    format!("record #{} cannot be decoded: {}", sequence, e),
                );
            }
        }

        if result.valid {
            info!("Audit chain verified: {}", result.summary());
        } else {
            warn!("Audit chain verification failed: {}", result.summary());
        }
        Ok(result)
    }

    /// Sequence ids in `[start, end)` whose stored hash does not match their
    /// own contents.
    pub async fn find_tampered(&self, start: u64, end: u64) -> Result<Vec<u64>> {
        let mut tampered = Vec::new();
        let mut decoded = Vec::new();
        for row in self.fetch_rows(start, end).await? {
            let sequence = row.sequence as u64;
            match AuditRecord::try_from(row) {
                Ok(record) => decoded.push(record),
                Err(_) => tampered.push(sequence),
            }
        }
        tampered.extend(find_tampered_records(&self.secret, &decoded));
        tampered.sort_unstable();
        Ok(tampered)
    }
}
