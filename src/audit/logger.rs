//! Audit Logger
//!
//! Appends audit events to the hash-chained `audit_log` table and answers
//! read-only queries over it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::{QueryBuilder, Sqlite};
use std::collections::BTreeMap;
use std::io::Write;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::audit::entry::{chain_hash, AuditEvent, AuditRecord, Severity};
use crate::canonical::{self, format_timestamp, GENESIS_HASH};
use crate::database::models::{AuditRow, AUDIT_COLUMNS};
use crate::database::{Database, Page, Pagination, SortOrder};
use crate::error::{LedgerError, Result};

/// Top actors reported by [`AuditLogger::statistics`].
const TOP_ACTOR_LIMIT: i64 = 10;

/// Rows fetched per round trip while exporting.
const EXPORT_BATCH: i64 = 500;

/// Audit logger over the shared database.
///
/// Cheap to clone; clones share the same write lock, so every clone of one
/// logger appends through a single critical section.
#[derive(Clone)]
pub struct AuditLogger {
    pub(crate) db: Database,
    pub(crate) secret: Arc<Vec<u8>>,
    write_lock: Arc<Mutex<()>>,
}

/// Filters for [`AuditLogger::query`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub actor_id: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub event_type: Option<String>,
    pub severity: Option<Severity>,
    /// Inclusive lower bound on the event timestamp.
    pub start_time: Option<DateTime<Utc>>,
    /// Inclusive upper bound on the event timestamp.
    pub end_time: Option<DateTime<Utc>>,
}

impl AuditFilter {
    pub fn time_range(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        Self {
            start_time: start,
            end_time: end,
            ..Self::default()
        }
    }
}

/// Sort keys accepted by [`AuditLogger::query`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortField {
    #[default]
    Sequence,
    Timestamp,
    EventType,
    Severity,
    ActorId,
}

impl SortField {
    fn as_sql(&self) -> &'static str {
        match self {
            SortField::Sequence => "sequence",
            SortField::Timestamp => "timestamp",
            SortField::EventType => "event_type",
            SortField::Severity => {
                "CASE severity WHEN 'low' THEN 0 WHEN 'medium' THEN 1 WHEN 'high' THEN 2 ELSE 3 END"
            }
            SortField::ActorId => "actor_id",
        }
    }
}

impl FromStr for SortField {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "sequence" => Ok(SortField::Sequence),
            "timestamp" => Ok(SortField::Timestamp),
            "event_type" => Ok(SortField::EventType),
            "severity" => Ok(SortField::Severity),
            "actor_id" => Ok(SortField::ActorId),
            _ => Err(format!("Unknown sort field: {}", s)),
        }
    }
}

/// Column scanned by [`AuditLogger::search`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchField {
    #[default]
    Details,
    Action,
    ResourceId,
}

impl SearchField {
    fn column(&self) -> &'static str {
        match self {
            SearchField::Details => "details",
            SearchField::Action => "action",
            SearchField::ResourceId => "resource_id",
        }
    }
}

/// Aggregate counts over a time window.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditStatistics {
    pub total_events: u64,
    pub events_by_type: BTreeMap<String, u64>,
    pub events_by_severity: BTreeMap<String, u64>,
    pub top_actors: Vec<ActorActivity>,
    /// Event count per UTC hour of day (0-23).
    pub hourly_distribution: BTreeMap<u32, u64>,
    #[serde(with = "canonical::option_timestamp")]
    pub period_start: Option<DateTime<Utc>>,
    #[serde(with = "canonical::option_timestamp")]
    pub period_end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActorActivity {
    pub actor_id: String,
    pub event_count: u64,
}

/// What to include in each exported line.
#[derive(Debug, Clone, Copy)]
pub struct ExportOptions {
    pub include_hash: bool,
    pub include_details: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            include_hash: true,
            include_details: true,
        }
    }
}

impl AuditLogger {
    /// Create a logger keyed with the chain secret.
    pub fn new(db: Database, secret: impl Into<Vec<u8>>) -> Result<Self> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(LedgerError::ConfigError("Audit secret must not be empty".to_string()));
        }

        Ok(Self {
            db,
            secret: Arc::new(secret),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Append an event to the end of the chain.
    ///
    /// The tail hash is read from the database inside the write lock on
    /// every call, so several loggers sharing one database stay consistent.
    pub async fn append(&self, mut event: AuditEvent) -> Result<AuditRecord> {
        event.validate()?;
        event.timestamp = canonical::normalize_timestamp(event.timestamp);

        let _guard = self.write_lock.lock().await;
        match self.append_locked(event).await {
            Ok(record) => {
                info!(
                    "Appended audit record #{} ({} {}), hash {}",
                    record.sequence, record.event.event_type, record.event.action, record.hash
                );
                Ok(record)
            }
            Err(e) => {
                error!("AUDIT APPEND FAILED, event not recorded: {}", e);
                Err(e.context("append audit event"))
            }
        }
    }

    async fn append_locked(&self, event: AuditEvent) -> Result<AuditRecord> {
        let mut tx = self.db.pool().begin().await?;

        let tail: Option<(i64, String)> =
            sqlx::query_as("SELECT sequence, hash FROM audit_log ORDER BY sequence DESC LIMIT 1")
                .fetch_optional(&mut *tx)
                .await?;

        let (sequence, previous_hash) = match tail {
            Some((last, hash)) => (last + 1, hash),
            None => (0, GENESIS_HASH.to_string()),
        };

        let hash = chain_hash(&self.secret, &previous_hash, &event)?;

        sqlx::query(
            r#"
            INSERT INTO audit_log (sequence, event_type, actor_id, resource_type, resource_id, action,
                                   details, severity, session_id, ip_address, user_agent, context,
                                   timestamp, previous_hash, hash)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(sequence)
        .bind(&event.event_type)
        .bind(&event.actor_id)
        .bind(&event.resource_type)
        .bind(&event.resource_id)
        .bind(&event.action)
        .bind(serde_json::to_string(&event.details)?)
        .bind(event.severity.as_str())
        .bind(&event.session_id)
        .bind(&event.ip_address)
        .bind(&event.user_agent)
        .bind(serde_json::to_string(&event.context)?)
        .bind(format_timestamp(&event.timestamp))
        .bind(&previous_hash)
        .bind(&hash)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(AuditRecord {
            sequence: sequence as u64,
            event,
            previous_hash,
            hash,
        })
    }

    /// Fetch one record by sequence id.
    pub async fn get(&self, sequence: u64) -> Result<AuditRecord> {
        let sql = format!("SELECT {} FROM audit_log WHERE sequence = ?", AUDIT_COLUMNS);
        let row: Option<AuditRow> = sqlx::query_as(&sql)
            .bind(sequence as i64)
            .fetch_optional(self.db.pool())
            .await?;

        row.ok_or_else(|| LedgerError::not_found("audit record", &sequence.to_string()))?
            .try_into()
    }

    /// Most recent record, if any.
    pub async fn head(&self) -> Result<Option<AuditRecord>> {
        let sql = format!("SELECT {} FROM audit_log ORDER BY sequence DESC LIMIT 1", AUDIT_COLUMNS);
        let row: Option<AuditRow> = sqlx::query_as(&sql).fetch_optional(self.db.pool()).await?;
        row.map(AuditRecord::try_from).transpose()
    }

    /// Number of stored records.
    pub async fn count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM audit_log")
            .fetch_one(self.db.pool())
            .await?;
        Ok(count as u64)
    }

    /// Filtered, sorted, paginated listing. Read-only.
    pub async fn query(
        &self,
        filter: &AuditFilter,
        sort: SortField,
        order: SortOrder,
        pagination: Pagination,
    ) -> Result<Page<AuditRecord>> {
        let mut count_qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM audit_log WHERE 1 = 1");
        push_filters(&mut count_qb, filter);
        let total: i64 = count_qb.build_query_scalar::<i64>().fetch_one(self.db.pool()).await?;

        let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM audit_log WHERE 1 = 1", AUDIT_COLUMNS));
        push_filters(&mut qb, filter);
        qb.push(format!(" ORDER BY {} {}", sort.as_sql(), order.as_sql()));
        if sort != SortField::Sequence {
            qb.push(format!(", sequence {}", order.as_sql()));
        }
        qb.push(" LIMIT ")
            .push_bind(pagination.limit() as i64)
            .push(" OFFSET ")
            .push_bind(pagination.offset() as i64);

        let rows: Vec<AuditRow> = qb.build_query_as::<AuditRow>().fetch_all(self.db.pool()).await?;
        let items = rows
            .into_iter()
            .map(AuditRecord::try_from)
            .collect::<Result<Vec<_>>>()?;

        debug!("Audit query returned {} of {} records", items.len(), total);
        Ok(Page {
            items,
            total: total as u64,
            offset: pagination.offset(),
            limit: pagination.limit(),
        })
    }

    /// Case-insensitive substring search in one column, newest first.
    pub async fn search(&self, text: &str, field: SearchField, pagination: Pagination) -> Result<Page<AuditRecord>> {
        if text.trim().is_empty() {
            return Err(LedgerError::invalid_field("search text", "must not be empty"));
        }

        let condition = format!(" WHERE instr(lower({}), lower(", field.column());

        let mut count_qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM audit_log");
        count_qb.push(&condition).push_bind(text.to_string()).push(")) > 0");
        let total: i64 = count_qb.build_query_scalar::<i64>().fetch_one(self.db.pool()).await?;

        let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM audit_log", AUDIT_COLUMNS));
        qb.push(&condition)
            .push_bind(text.to_string())
            .push(")) > 0 ORDER BY sequence DESC LIMIT ")
            .push_bind(pagination.limit() as i64)
            .push(" OFFSET ")
            .push_bind(pagination.offset() as i64);

        let rows: Vec<AuditRow> = qb.build_query_as::<AuditRow>().fetch_all(self.db.pool()).await?;
        let items = rows
            .into_iter()
            .map(AuditRecord::try_from)
            .collect::<Result<Vec<_>>>()?;

        Ok(Page {
            items,
            total: total as u64,
            offset: pagination.offset(),
            limit: pagination.limit(),
        })
    }

    /// Counts by type, severity, actor and hour of day. No integrity checks.
    pub async fn statistics(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<AuditStatistics> {
        let filter = AuditFilter::time_range(start, end);
        let pool = self.db.pool();

        let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM audit_log WHERE 1 = 1");
        push_filters(&mut qb, &filter);
        let total: i64 = qb.build_query_scalar::<i64>().fetch_one(pool).await?;

        let mut qb = QueryBuilder::<Sqlite>::new("SELECT event_type, COUNT(*) FROM audit_log WHERE 1 = 1");
        push_filters(&mut qb, &filter);
        qb.push(" GROUP BY event_type");
        let by_type: Vec<(String, i64)> = qb.build_query_as().fetch_all(pool).await?;

        let mut qb = QueryBuilder::<Sqlite>::new("SELECT severity, COUNT(*) FROM audit_log WHERE 1 = 1");
        push_filters(&mut qb, &filter);
        qb.push(" GROUP BY severity");
        let by_severity: Vec<(String, i64)> = qb.build_query_as().fetch_all(pool).await?;

        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT actor_id, COUNT(*) AS event_count FROM audit_log WHERE actor_id IS NOT NULL",
        );
        push_filters(&mut qb, &filter);
        qb.push(" GROUP BY actor_id ORDER BY event_count DESC, actor_id ASC LIMIT ")
            .push_bind(TOP_ACTOR_LIMIT);
        let top_actors: Vec<(String, i64)> = qb.build_query_as().fetch_all(pool).await?;

        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT CAST(substr(timestamp, 12, 2) AS INTEGER) AS hour, COUNT(*) FROM audit_log WHERE 1 = 1",
        );
        push_filters(&mut qb, &filter);
        qb.push(" GROUP BY hour");
        let hourly: Vec<(i64, i64)> = qb.build_query_as().fetch_all(pool).await?;

        Ok(AuditStatistics {
            total_events: total as u64,
            events_by_type: by_type.into_iter().map(|(k, v)| (k, v as u64)).collect(),
            events_by_severity: by_severity.into_iter().map(|(k, v)| (k, v as u64)).collect(),
            top_actors: top_actors
                .into_iter()
                .map(|(actor_id, count)| ActorActivity {
                    actor_id,
                    event_count: count as u64,
                })
                .collect(),
            hourly_distribution: hourly.into_iter().map(|(h, v)| (h as u32, v as u64)).collect(),
            period_start: start,
            period_end: end,
        })
    }

    /// Write matching records to `writer` as JSON lines in chain order.
    /// Returns the number of lines written.
    pub async fn export<W: Write>(&self, filter: &AuditFilter, options: ExportOptions, writer: &mut W) -> Result<u64> {
        let mut written = 0u64;
        let mut after: i64 = -1;

        loop {
            let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM audit_log WHERE sequence > ", AUDIT_COLUMNS));
            qb.push_bind(after);
            push_filters(&mut qb, filter);
            qb.push(" ORDER BY sequence ASC LIMIT ").push_bind(EXPORT_BATCH);

            let rows: Vec<AuditRow> = qb.build_query_as::<AuditRow>().fetch_all(self.db.pool()).await?;
            if rows.is_empty() {
                break;
            }

            for row in rows {
                after = row.sequence;
                let record = AuditRecord::try_from(row)?;
                let mut value = serde_json::to_value(&record)?;
                if let Value::Object(map) = &mut value {
                    if !options.include_hash {
                        map.remove("hash");
                        map.remove("previous_hash");
                    }
                    if !options.include_details {
                        map.remove("details");
                        map.remove("context");
                    }
                }
                serde_json::to_writer(&mut *writer, &value)?;
                writer.write_all(b"\n")?;
                written += 1;
            }
        }

        writer.flush()?;
        info!("Exported {} audit records", written);
        Ok(written)
    }

    /// Raw rows in `[start, end)` in ascending sequence order.
    pub(crate) async fn fetch_rows(&self, start: u64, end: u64) -> Result<Vec<AuditRow>> {
        let sql = format!(
            "SELECT {} FROM audit_log WHERE sequence >= ? AND sequence < ? ORDER BY sequence ASC",
            AUDIT_COLUMNS
        );
        Ok(sqlx::query_as(&sql)
            .bind(start as i64)
            .bind(end.min(i64::MAX as u64) as i64)
            .fetch_all(self.db.pool())
            .await?)
    }

    /// Stored hash of one record, used to anchor range checks.
    pub(crate) async fn stored_hash(&self, sequence: u64) -> Result<Option<String>> {
        Ok(sqlx::query_scalar("SELECT hash FROM audit_log WHERE sequence = ?")
            .bind(sequence as i64)
            .fetch_optional(self.db.pool())
            .await?)
    }

    /// Sequence id one past the last record.
    pub(crate) async fn next_sequence(&self) -> Result<u64> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(sequence) FROM audit_log")
            .fetch_one(self.db.pool())
            .await?;
        Ok(max.map(|m| m as u64 + 1).unwrap_or(0))
    }
}

fn push_filters(qb: &mut QueryBuilder<'_, Sqlite>, filter: &AuditFilter) {
    if let Some(actor_id) = &filter.actor_id {
        qb.push(" AND actor_id = ").push_bind(actor_id.clone());
    }
    if let Some(resource_type) = &filter.resource_type {
        qb.push(" AND resource_type = ").push_bind(resource_type.clone());
    }
    if let Some(resource_id) = &filter.resource_id {
        qb.push(" AND resource_id = ").push_bind(resource_id.clone());
    }
    if let Some(event_type) = &filter.event_type {
        qb.push(" AND event_type = ").push_bind(event_type.clone());
    }
    if let Some(severity) = filter.severity {
        qb.push(" AND severity = ").push_bind(severity.as_str());
    }
    // Canonical timestamps sort lexicographically in time order.
    if let Some(start) = &filter.start_time {
        qb.push(" AND timestamp >= ").push_bind(format_timestamp(start));
    }
    if let Some(end) = &filter.end_time {
        qb.push(" AND timestamp <= ").push_bind(format_timestamp(end));
    }
}
