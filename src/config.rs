use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{LedgerError, Result};

/// Default config file, looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_NAME: &str = "clinical-ledger";

/// Prefix of environment overrides, e.g. `LEDGER_DATABASE_URL`.
pub const ENV_PREFIX: &str = "LEDGER";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub key_path: PathBuf,
    pub blob_root: PathBuf,
    /// HMAC key of the audit chain. Losing it makes the chain unverifiable.
    pub audit_secret: String,
    pub blob_timeout_ms: u64,
    pub log_filter: String,
}

impl AppConfig {
    /// Defaults, then the config file, then `LEDGER_*` environment variables.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder()
            .set_default("database_url", "sqlite://clinical-ledger.db")?
            .set_default("key_path", "keys/evidence-signing.json")?
            .set_default("blob_root", "blobs")?
            .set_default("blob_timeout_ms", 10_000i64)?
            .set_default("log_filter", "clinical_ledger=info")?;

        builder = match config_file {
            Some(path) => builder.add_source(File::from(path).required(true)),
            None => builder.add_source(File::with_name(DEFAULT_CONFIG_NAME).required(false)),
        };

        let config: AppConfig = builder
            .add_source(Environment::with_prefix(ENV_PREFIX))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.audit_secret.trim().is_empty() {
            return Err(LedgerError::ConfigError("audit_secret must be set".to_string()));
        }
        if self.blob_timeout_ms == 0 {
            return Err(LedgerError::ConfigError("blob_timeout_ms must be greater than zero".to_string()));
        }
        if self.database_url.trim().is_empty() {
            return Err(LedgerError::ConfigError("database_url must be set".to_string()));
        }
        Ok(())
    }

    pub fn blob_timeout(&self) -> Duration {
        Duration::from_millis(self.blob_timeout_ms)
    }
}
