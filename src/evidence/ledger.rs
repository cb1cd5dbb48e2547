//! Evidence Ledger
//!
//! Stores evidence records as signed, content-addressed packages and
//! verifies them on the way back out. Each package certifies itself: the
//! blob bytes hash to `content_hash`, and `content_hash` carries a signature
//! from the ledger's signing key.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{QueryBuilder, Sqlite};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::canonical::{self, format_timestamp, sha256_hex};
use crate::crypto::KeyManager;
use crate::database::models::{EvidenceRow, EVIDENCE_COLUMNS};
use crate::database::{Database, Page, Pagination};
use crate::error::{LedgerError, Result};
use crate::evidence::package::{seal, EvidencePackage, FileAttachment};
use crate::evidence::record::{EvidenceRecord, EvidenceType};
use crate::storage::{BlobHandle, BlobStore};

/// Proof of storage handed back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Receipt {
    pub evidence_id: String,
    pub content_hash: String,
    pub file_content_hash: Option<String>,
    pub signature: String,
    pub key_id: String,
    pub storage_handle: String,
    pub file_handle: Option<String>,
    #[serde(with = "canonical::timestamp")]
    pub stored_at: DateTime<Utc>,
}

/// Integrity checks run on every retrieval. The two flags are independent:
/// a hash mismatch means the stored bytes changed, a signature mismatch
/// means the lookup row's hash/signature pair was altered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verification {
    pub hash_valid: bool,
    pub signature_valid: bool,
    /// `None` when no file is attached.
    pub file_hash_valid: Option<bool>,
    pub key_id: String,
}

impl Verification {
    pub fn is_valid(&self) -> bool {
        self.hash_valid && self.signature_valid
    }
}

#[derive(Debug, Clone)]
pub struct Retrieved {
    pub receipt: Receipt,
    /// `None` when the package bytes no longer decode.
    pub record: Option<EvidenceRecord>,
    pub file: Option<Vec<u8>>,
    pub verification: Verification,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemVerification {
    pub evidence_id: String,
    pub valid: bool,
    pub hash_valid: bool,
    pub signature_valid: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainVerification {
    pub overall_valid: bool,
    pub total: usize,
    pub valid_count: usize,
    pub items: Vec<ItemVerification>,
}

/// Search filters over the lookup index. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct EvidenceFilter {
    /// Case-insensitive substring of title or description.
    pub text: Option<String>,
    pub evidence_type: Option<EvidenceType>,
    /// Matches records carrying any of these tags.
    pub tags: Vec<String>,
    pub created_by: Option<String>,
    pub source: Option<String>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
}

/// Index entry returned by search; no blob access or verification involved.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvidenceSummary {
    pub evidence_id: String,
    pub evidence_type: String,
    pub title: String,
    pub description: String,
    pub source: String,
    pub created_by: Option<String>,
    pub tags: Vec<String>,
    pub evidence_quality: String,
    pub content_hash: String,
    pub supersedes: Option<String>,
    pub created_at: String,
}

impl TryFrom<EvidenceRow> for EvidenceSummary {
    type Error = LedgerError;

    fn try_from(row: EvidenceRow) -> Result<Self> {
        Ok(Self {
            tags: serde_json::from_str(&row.tags)?,
            evidence_id: row.evidence_id,
            evidence_type: row.evidence_type,
            title: row.title,
            description: row.description,
            source: row.source,
            created_by: row.created_by,
            evidence_quality: row.evidence_quality,
            content_hash: row.content_hash,
            supersedes: row.supersedes,
            created_at: row.created_at,
        })
    }
}

impl TryFrom<&EvidenceRow> for Receipt {
    type Error = LedgerError;

    fn try_from(row: &EvidenceRow) -> Result<Self> {
        Ok(Self {
            evidence_id: row.evidence_id.clone(),
            content_hash: row.content_hash.clone(),
            file_content_hash: row.file_content_hash.clone(),
            signature: row.digital_signature.clone(),
            key_id: row.key_id.clone(),
            storage_handle: row.storage_handle.clone(),
            file_handle: row.file_handle.clone(),
            stored_at: canonical::parse_timestamp(&row.stored_at)?,
        })
    }
}

/// Signed, content-addressed evidence store.
#[derive(Clone)]
pub struct EvidenceLedger {
    db: Database,
    blobs: Arc<dyn BlobStore>,
    keys: Arc<KeyManager>,
    blob_timeout: Duration,
}

impl EvidenceLedger {
    pub fn new(db: Database, blobs: Arc<dyn BlobStore>, keys: Arc<KeyManager>, blob_timeout: Duration) -> Self {
        Self {
            db,
            blobs,
            keys,
            blob_timeout,
        }
    }

    pub fn keys(&self) -> &KeyManager {
        &self.keys
    }

    async fn with_timeout<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.blob_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(LedgerError::TimeoutError(format!(
                "{} did not finish within {:?}",
                operation, self.blob_timeout
            ))),
        }
    }

    /// Blob bytes, or `None` when the store no longer has them. A lost blob
    /// behind a known row is an integrity failure, not an unknown id.
    async fn fetch_blob(&self, handle: &BlobHandle) -> Result<Option<Vec<u8>>> {
        match self.with_timeout("blob get", self.blobs.get(handle)).await {
            Ok(data) => Ok(Some(data)),
            Err(LedgerError::NotFoundError(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn pin(&self, handle: &BlobHandle) {
        match self.with_timeout("blob pin", self.blobs.pin(handle)).await {
            Ok(true) => debug!("Pinned blob {}", handle),
            Ok(false) => warn!("Blob {} could not be pinned: not present", handle),
            Err(e) => warn!("Blob {} could not be pinned: {}", handle, e),
        }
    }

    /// Store `record`, with an optional attached file.
    ///
    /// Blobs go in first and the lookup row is the commit point, so a
    /// failure leaves at most unreferenced content-addressed blobs behind.
    /// Resubmitting a record that is already stored returns its receipt.
    pub async fn store(&self, mut record: EvidenceRecord, file: Option<&[u8]>) -> Result<Receipt> {
        record.normalize();
        record.ensure_id()?;
        record.validate()?;

        let evidence_id = record.evidence_id.clone();
        match self.store_inner(record, file).await {
            Ok(receipt) => Ok(receipt),
            Err(e) => {
                error!("Failed to store evidence {}: {}", evidence_id, e);
                Err(e.context(&format!("store evidence {}", evidence_id)))
            }
        }
    }

    async fn store_inner(&self, record: EvidenceRecord, file: Option<&[u8]>) -> Result<Receipt> {
        if let Some(original) = &record.supersedes {
            if self.fetch_row(original).await?.is_none() {
                return Err(LedgerError::not_found("superseded evidence", original));
            }
        }

        let attachment = match file {
            Some(data) => {
                let handle = self.with_timeout("blob put", self.blobs.put(data)).await?;
                Some(FileAttachment::describe(data, handle))
            }
            None => None,
        };

        let package = EvidencePackage::new(record, attachment);
        let (bytes, content_hash) = seal(&package)?;
        let record = &package.record;

        if let Some(existing) = self.fetch_row_by_hash(&content_hash).await? {
            debug!("Evidence {} already stored, returning prior receipt", existing.evidence_id);
            return Receipt::try_from(&existing);
        }
        if self.fetch_row(&record.evidence_id).await?.is_some() {
            return Err(LedgerError::invalid_field(
                "evidence_id",
                &format!("{} is already stored with different content", record.evidence_id),
            ));
        }

        let signature = self.keys.sign(content_hash.as_bytes())?;
        let key_id = signature.split_once(':').map(|(id, _)| id.to_string()).unwrap_or_default();

        let storage_handle = self.with_timeout("blob put", self.blobs.put(&bytes)).await?;
        self.pin(&storage_handle).await;
        if let Some(attachment) = &package.file {
            self.pin(&attachment.handle).await;
        }

        let stored_at = canonical::now();
        let receipt = Receipt {
            evidence_id: record.evidence_id.clone(),
            content_hash: content_hash.clone(),
            file_content_hash: package.file.as_ref().map(|f| f.content_hash.clone()),
            signature,
            key_id,
            storage_handle: storage_handle.to_string(),
            file_handle: package.file.as_ref().map(|f| f.handle.to_string()),
            stored_at,
        };

        let inserted = sqlx::query(
            r#"
            INSERT INTO evidence (evidence_id, evidence_type, title, description, source, created_by,
                                  tags, evidence_quality, content_hash, file_content_hash, storage_handle,
                                  file_handle, digital_signature, key_id, supersedes, created_at, stored_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&receipt.evidence_id)
        .bind(record.evidence_type.as_str())
        .bind(&record.title)
        .bind(&record.description)
        .bind(&record.source)
        .bind(&record.created_by)
        .bind(serde_json::to_string(&record.tags)?)
        .bind(record.metadata.evidence_quality.as_str())
        .bind(&receipt.content_hash)
        .bind(&receipt.file_content_hash)
        .bind(&receipt.storage_handle)
        .bind(&receipt.file_handle)
        .bind(&receipt.signature)
        .bind(&receipt.key_id)
        .bind(&record.supersedes)
        .bind(format_timestamp(&record.created_at))
        .bind(format_timestamp(&stored_at))
        .execute(self.db.pool())
        .await;

        if let Err(e) = inserted {
            // A concurrent duplicate submission may have committed first.
            if let Some(existing) = self.fetch_row_by_hash(&content_hash).await? {
                debug!("Evidence {} committed concurrently, returning its receipt", existing.evidence_id);
                return Receipt::try_from(&existing);
            }
            return Err(e.into());
        }

        info!(
            "Stored evidence {} ({}), content hash {}, signed by {}",
            receipt.evidence_id, record.evidence_type, receipt.content_hash, receipt.key_id
        );
        Ok(receipt)
    }

    /// Store `record` as a new version of `original_id`.
    pub async fn supersede(&self, original_id: &str, mut record: EvidenceRecord, file: Option<&[u8]>) -> Result<Receipt> {
        record.supersedes = Some(original_id.to_string());
        self.store(record, file).await
    }

    /// Ids from `evidence_id` back through its `supersedes` links to the
    /// first version, newest first.
    pub async fn lineage(&self, evidence_id: &str) -> Result<Vec<String>> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = Some(evidence_id.to_string());

        while let Some(id) = current {
            if !seen.insert(id.clone()) {
                warn!("Evidence lineage of {} loops at {}", evidence_id, id);
                break;
            }
            let row = self
                .fetch_row(&id)
                .await?
                .ok_or_else(|| LedgerError::not_found("evidence", &id))?;
            chain.push(id);
            current = row.supersedes;
        }
        Ok(chain)
    }

    /// Receipt of a stored record without touching the blob store.
    pub async fn receipt(&self, evidence_id: &str) -> Result<Receipt> {
        let row = self
            .fetch_row(evidence_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("evidence", evidence_id))?;
        Receipt::try_from(&row)
    }

    /// Fetch and verify a stored record. Integrity failures come back as
    /// flags on [`Verification`], not as errors.
    pub async fn retrieve(&self, evidence_id: &str) -> Result<Retrieved> {
        let row = self
            .fetch_row(evidence_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("evidence", evidence_id))?;
        let receipt = Receipt::try_from(&row)?;

        let handle = BlobHandle::parse(&row.storage_handle).map_err(|e| e.context("storage handle"))?;
        let bytes = self
            .fetch_blob(&handle)
            .await
            .map_err(|e| e.context(&format!("package of {}", evidence_id)))?;

        let mut hash_valid = bytes.as_ref().is_some_and(|b| sha256_hex(b) == row.content_hash);

        let package = match bytes.as_deref().map(EvidencePackage::decode) {
            None => {
                warn!("Evidence {} package blob {} is missing", evidence_id, handle);
                None
            }
            Some(Ok(package)) if package.record.evidence_id == row.evidence_id => Some(package),
            Some(Ok(package)) => {
                warn!(
                    "Evidence {} points at the package of {}",
                    evidence_id, package.record.evidence_id
                );
                hash_valid = false;
                None
            }
            Some(Err(e)) => {
                warn!("Evidence {} package does not decode: {}", evidence_id, e);
                hash_valid = false;
                None
            }
        };

        let mut file = None;
        let mut file_hash_valid = None;
        if let Some(file_handle) = &row.file_handle {
            let handle = BlobHandle::parse(file_handle).map_err(|e| e.context("file handle"))?;
            let data = self
                .fetch_blob(&handle)
                .await
                .map_err(|e| e.context(&format!("file of {}", evidence_id)))?;
            if data.is_none() {
                warn!("Evidence {} file blob {} is missing", evidence_id, handle);
            }

            let expected = package
                .as_ref()
                .and_then(|p| p.file.as_ref())
                .map(|f| f.content_hash.as_str())
                .or(row.file_content_hash.as_deref());
            let matches = data.as_ref().is_some_and(|data| {
                expected == Some(sha256_hex(data).as_str()) && row.file_content_hash.as_deref() == expected
            });
            file_hash_valid = Some(matches);
            hash_valid &= matches;
            file = data;
        }

        let signature_valid = self.keys.verify(row.content_hash.as_bytes(), &row.digital_signature);

        if !hash_valid {
            warn!("Evidence {} failed hash verification", evidence_id);
        }
        if !signature_valid {
            warn!("Evidence {} failed signature verification", evidence_id);
        }

        Ok(Retrieved {
            verification: Verification {
                hash_valid,
                signature_valid,
                file_hash_valid,
                key_id: row.key_id.clone(),
            },
            record: package.map(|p| p.record),
            file,
            receipt,
        })
    }

    /// Verify each id independently. Lookup misses and blob failures make
    /// that item invalid; they do not fail the call.
    pub async fn verify_chain(&self, evidence_ids: &[String]) -> ChainVerification {
        let mut items = Vec::with_capacity(evidence_ids.len());

        for evidence_id in evidence_ids {
            let item = match self.retrieve(evidence_id).await {
                Ok(retrieved) => ItemVerification {
                    evidence_id: evidence_id.clone(),
                    valid: retrieved.verification.is_valid(),
                    hash_valid: retrieved.verification.hash_valid,
                    signature_valid: retrieved.verification.signature_valid,
                    error: None,
                },
                Err(e) => ItemVerification {
                    evidence_id: evidence_id.clone(),
                    valid: false,
                    hash_valid: false,
                    signature_valid: false,
                    error: Some(e.to_string()),
                },
            };
            items.push(item);
        }

        let valid_count = items.iter().filter(|i| i.valid).count();
        let result = ChainVerification {
            overall_valid: valid_count == items.len(),
            total: items.len(),
            valid_count,
            items,
        };

        if result.overall_valid {
            info!("Verified {} evidence items", result.total);
        } else {
            warn!(
                "Evidence verification: {} of {} items invalid",
                result.total - result.valid_count,
                result.total
            );
        }
        result
    }

    /// Metadata search over the lookup index, newest first.
    pub async fn search(&self, filter: &EvidenceFilter, pagination: Pagination) -> Result<Page<EvidenceSummary>> {
        let mut count_qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM evidence WHERE 1 = 1");
        push_filters(&mut count_qb, filter);
        let total: i64 = count_qb.build_query_scalar::<i64>().fetch_one(self.db.pool()).await?;

        let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM evidence WHERE 1 = 1", EVIDENCE_COLUMNS));
        push_filters(&mut qb, filter);
        qb.push(" ORDER BY created_at DESC, evidence_id DESC LIMIT ")
            .push_bind(pagination.limit() as i64)
            .push(" OFFSET ")
            .push_bind(pagination.offset() as i64);

        let rows: Vec<EvidenceRow> = qb.build_query_as::<EvidenceRow>().fetch_all(self.db.pool()).await?;
        let items = rows
            .into_iter()
            .map(EvidenceSummary::try_from)
            .collect::<Result<Vec<_>>>()?;

        Ok(Page {
            items,
            total: total as u64,
            offset: pagination.offset(),
            limit: pagination.limit(),
        })
    }

    async fn fetch_row(&self, evidence_id: &str) -> Result<Option<EvidenceRow>> {
        let sql = format!("SELECT {} FROM evidence WHERE evidence_id = ?", EVIDENCE_COLUMNS);
        Ok(sqlx::query_as(&sql)
            .bind(evidence_id)
            .fetch_optional(self.db.pool())
            .await?)
    }

    async fn fetch_row_by_hash(&self, content_hash: &str) -> Result<Option<EvidenceRow>> {
        let sql = format!("SELECT {} FROM evidence WHERE content_hash = ?", EVIDENCE_COLUMNS);
        Ok(sqlx::query_as(&sql)
            .bind(content_hash)
            .fetch_optional(self.db.pool())
            .await?)
    }
}

fn push_filters(qb: &mut QueryBuilder<'_, Sqlite>, filter: &EvidenceFilter) {
    if let Some(text) = filter.text.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        qb.push(" AND (instr(lower(title), lower(")
            .push_bind(text.to_string())
            .push(")) > 0 OR instr(lower(description), lower(")
            .push_bind(text.to_string())
            .push(")) > 0)");
    }
    if let Some(evidence_type) = filter.evidence_type {
        qb.push(" AND evidence_type = ").push_bind(evidence_type.as_str());
    }
    if !filter.tags.is_empty() {
        qb.push(" AND EXISTS (SELECT 1 FROM json_each(evidence.tags) WHERE json_each.value IN (");
        let mut tags = qb.separated(", ");
        for tag in &filter.tags {
            tags.push_bind(tag.trim().to_lowercase());
        }
        tags.push_unseparated("))");
    }
    if let Some(created_by) = &filter.created_by {
        qb.push(" AND created_by = ").push_bind(created_by.clone());
    }
    if let Some(source) = &filter.source {
        qb.push(" AND source = ").push_bind(source.clone());
    }
    if let Some(from) = &filter.created_from {
        qb.push(" AND created_at >= ").push_bind(format_timestamp(from));
    }
    if let Some(to) = &filter.created_to {
        qb.push(" AND created_at <= ").push_bind(format_timestamp(to));
    }
}
