use thiserror::Error;

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(format!("JSON serialization error: {}", err))
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        Self::PersistenceError(format!("Database error: {}", err))
    }
}

impl From<sqlx::migrate::MigrateError> for LedgerError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::PersistenceError(format!("Migration error: {}", err))
    }
}

impl From<std::io::Error> for LedgerError {
    fn from(err: std::io::Error) -> Self {
        Self::PersistenceError(format!("I/O error: {}", err))
    }
}

impl From<config::ConfigError> for LedgerError {
    fn from(err: config::ConfigError) -> Self {
        Self::ConfigError(err.to_string())
    }
}

/// Failures surfaced by the ledger.
///
/// Integrity problems are deliberately absent: verification calls report
/// tampering through flags on their result types.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Malformed input. Nothing was persisted.
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Backend unavailable or write failed. Nothing was partially written.
    #[error("Persistence error: {0}")]
    PersistenceError(String),

    #[error("Not found: {0}")]
    NotFoundError(String),

    /// Signing key missing or corrupt.
    #[error("Key store error: {0}")]
    KeyStoreError(String),

    #[error("Blob store error: {0}")]
    BlobError(String),

    /// The backend did not answer in time. The outcome is unknown and the
    /// call is safe to repeat.
    #[error("Timed out, outcome unknown: {0}")]
    TimeoutError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

pub type Result<T> = std::result::Result<T, LedgerError>;

impl LedgerError {
    pub fn not_found(kind: &str, id: &str) -> Self {
        Self::NotFoundError(format!("{} {}", kind, id))
    }

    pub fn invalid_field(field: &str, reason: &str) -> Self {
        Self::ValidationError(format!("{}: {}", field, reason))
    }

    /// Attach operation context while keeping the variant.
    pub fn context(self, ctx: &str) -> Self {
        match self {
            Self::ConfigError(m) => Self::ConfigError(format!("{}: {}", ctx, m)),
            Self::ValidationError(m) => Self::ValidationError(format!("{}: {}", ctx, m)),
            Self::PersistenceError(m) => Self::PersistenceError(format!("{}: {}", ctx, m)),
            Self::NotFoundError(m) => Self::NotFoundError(format!("{}: {}", ctx, m)),
            Self::KeyStoreError(m) => Self::KeyStoreError(format!("{}: {}", ctx, m)),
            Self::BlobError(m) => Self::BlobError(format!("{}: {}", ctx, m)),
            Self::TimeoutError(m) => Self::TimeoutError(format!("{}: {}", ctx, m)),
            Self::SerializationError(m) => Self::SerializationError(format!("{}: {}", ctx, m)),
        }
    }

    /// True for errors where a retry with the same input may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TimeoutError(_) | Self::BlobError(_) | Self::PersistenceError(_))
    }
}
