//! Merkle Checkpoints
//!
//! Summarizes a verified range of the audit chain as a single Merkle root
//! that can be handed to an external notary. Leaves are record hashes; an
//! odd node at any level is paired with itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::audit::logger::AuditLogger;
use crate::canonical::{self, sha256_hex};
use crate::error::{LedgerError, Result};

fn hash_pair(left: &str, right: &str) -> String {
    let mut combined = String::with_capacity(left.len() + right.len());
    combined.push_str(left);
    combined.push_str(right);
    sha256_hex(combined.as_bytes())
}

/// Merkle root over `leaves`, or `None` when there are none.
pub fn merkle_root(leaves: &[String]) -> Option<String> {
    if leaves.is_empty() {
        return None;
    }

    let mut level: Vec<String> = leaves.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| hash_pair(&pair[0], pair.get(1).unwrap_or(&pair[0])))
            .collect();
    }
    level.pop()
}

/// Which side of the running hash a proof sibling sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub hash: String,
    pub side: Side,
}

/// Inclusion proof for one leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub leaf: String,
    pub index: usize,
    pub steps: Vec<ProofStep>,
    pub root: String,
}

impl MerkleProof {
    pub fn verify(&self) -> bool {
        verify_proof(&self.leaf, &self.steps, &self.root)
    }
}

/// Inclusion proof for `leaves[index]`.
pub fn merkle_proof(leaves: &[String], index: usize) -> Option<MerkleProof> {
    if index >= leaves.len() {
        return None;
    }

    let mut steps = Vec::new();
    let mut level: Vec<String> = leaves.to_vec();
    let mut position = index;

    while level.len() > 1 {
        let sibling = if position % 2 == 0 {
            ProofStep {
                hash: level.get(position + 1).unwrap_or(&level[position]).clone(),
                side: Side::Right,
            }
        } else {
            ProofStep {
                hash: level[position - 1].clone(),
                side: Side::Left,
            }
        };
        steps.push(sibling);

        level = level
            .chunks(2)
            .map(|pair| hash_pair(&pair[0], pair.get(1).unwrap_or(&pair[0])))
            .collect();
        position /= 2;
    }

    Some(MerkleProof {
        leaf: leaves[index].clone(),
        index,
        steps,
        root: level.pop()?,
    })
}

pub fn verify_proof(leaf: &str, steps: &[ProofStep], root: &str) -> bool {
    let computed = steps.iter().fold(leaf.to_string(), |acc, step| match step.side {
        Side::Left => hash_pair(&step.hash, &acc),
        Side::Right => hash_pair(&acc, &step.hash),
    });
    computed == root
}

/// Merkle summary of a verified chain range `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub start: u64,
    pub end: u64,
    pub record_count: u64,
    pub merkle_root: String,
    /// Hash of the last record in the range.
    pub head_hash: String,
    #[serde(with = "canonical::timestamp")]
    pub created_at: DateTime<Utc>,
}

impl AuditLogger {
    /// Build a checkpoint over `[start, end)`. The range is verified first;
    /// a range that fails verification or holds no records is rejected.
    pub async fn checkpoint(&self, start: u64, end: u64) -> Result<Checkpoint> {
        let verification = self.verify_range(start, end).await?;
        if !verification.valid {
            return Err(LedgerError::ValidationError(format!(
                "Cannot checkpoint an unverified range: {}",
                verification.summary()
            )));
        }

        let leaves: Vec<String> = self
            .fetch_rows(verification.start, verification.end)
            .await?
            .into_iter()
            .map(|row| row.hash)
            .collect();

        let head_hash = leaves
            .last()
            .cloned()
            .ok_or_else(|| LedgerError::ValidationError(format!("No audit records in [{}, {})", start, end)))?;
        let merkle_root = merkle_root(&leaves)
            .ok_or_else(|| LedgerError::ValidationError("Empty checkpoint range".to_string()))?;

        let checkpoint = Checkpoint {
            start: verification.start,
            end: verification.end,
            record_count: leaves.len() as u64,
            merkle_root,
            head_hash,
            created_at: canonical::now(),
        };

        info!(
            "Audit checkpoint [{}, {}): {} records, root {}",
            checkpoint.start, checkpoint.end, checkpoint.record_count, checkpoint.merkle_root
        );
        Ok(checkpoint)
    }
}
