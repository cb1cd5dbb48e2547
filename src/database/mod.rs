pub mod models;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::error::Result;

/// Shared SQLite pool holding the audit chain and the evidence index.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        info!("Connected to {}", database_url);
        Ok(Database { pool })
    }

    /// Private in-memory database. A single connection is kept alive for
    /// the lifetime of the pool, since each SQLite memory connection is its
    /// own database.
    pub async fn new_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Database { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Sort direction for listing queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

impl FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            _ => Err(format!("Unknown sort order: {}", s)),
        }
    }
}

/// Offset/limit window over a result set. Only built through the
/// constructors, which keep both values bindable as SQLite integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Pagination {
    offset: u64,
    limit: u64,
}

impl Pagination {
    pub const MAX_LIMIT: u64 = 1000;

    pub fn new(offset: u64, limit: u64) -> Self {
        Self {
            offset: offset.min(i64::MAX as u64),
            limit: limit.clamp(1, Self::MAX_LIMIT),
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// 1-based page numbering, as the search endpoints present it.
    pub fn page(page: u64, per_page: u64) -> Self {
        let per_page = per_page.clamp(1, Self::MAX_LIMIT);
        Self::new(page.saturating_sub(1).saturating_mul(per_page), per_page)
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self::new(0, 50)
    }
}

/// One window of results plus the size of the whole filtered set.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub offset: u64,
    pub limit: u64,
}

impl<T> Page<T> {
    pub fn current_page(&self) -> u64 {
        self.offset / self.limit.max(1) + 1
    }

    pub fn total_pages(&self) -> u64 {
        let limit = self.limit.max(1);
        (self.total + limit - 1) / limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_database_migrates() {
        let db = Database::new_in_memory().await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM audit_log")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
        assert!(!db.pool().is_closed());
    }

    #[tokio::test]
    async fn test_file_database_created() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("ledger.db").display());
        let db = Database::new(&url).await.unwrap();
        db.run_migrations().await.unwrap();
        // Running twice is a no-op.
        db.run_migrations().await.unwrap();
        assert!(dir.path().join("ledger.db").exists());
    }

    #[test]
    fn test_pagination_pages() {
        assert_eq!(Pagination::page(1, 20), Pagination::new(0, 20));
        assert_eq!(Pagination::page(3, 20), Pagination::new(40, 20));
        assert_eq!(Pagination::page(0, 20).offset(), 0);
        assert_eq!(Pagination::new(0, 0).limit(), 1);
        assert_eq!(Pagination::new(0, u64::MAX).limit(), Pagination::MAX_LIMIT);
        assert_eq!(Pagination::new(u64::MAX, 10).offset(), i64::MAX as u64);
        assert_eq!(Pagination::page(u64::MAX, 1000).offset(), i64::MAX as u64);
    }

    #[test]
    fn test_page_counts() {
        let page: Page<u8> = Page {
            items: vec![],
            total: 101,
            offset: 50,
            limit: 50,
        };
        assert_eq!(page.total_pages(), 3);
        assert_eq!(page.current_page(), 2);
    }
}
