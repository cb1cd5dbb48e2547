//! Operator tooling for the clinical ledger.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use clinical_ledger::audit::{AuditFilter, AuditLogger, ExportOptions};
use clinical_ledger::canonical;
use clinical_ledger::crypto::KeyManager;
use clinical_ledger::evidence::EvidenceLedger;
use clinical_ledger::storage::FsBlobStore;
use clinical_ledger::{AppConfig, Database};

#[derive(Parser)]
#[command(name = "clinical-ledger")]
#[command(about = "Tamper-evident clinical audit ledger and signed evidence store")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ./clinical-ledger.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the evidence signing key if it does not exist yet
    Keygen,

    /// Retire the active signing key and generate a new one
    RotateKey,

    /// Verify the audit hash chain over [start, end)
    VerifyAudit {
        #[arg(long, default_value_t = 0)]
        start: u64,
        /// Exclusive end; defaults to the chain tail
        #[arg(long)]
        end: Option<u64>,
    },

    /// Print a Merkle checkpoint over [start, end)
    Checkpoint {
        #[arg(long, default_value_t = 0)]
        start: u64,
        #[arg(long)]
        end: Option<u64>,
    },

    /// Print audit statistics
    Stats {
        /// RFC 3339 lower bound on event time
        #[arg(long)]
        since: Option<String>,
        /// RFC 3339 upper bound on event time
        #[arg(long)]
        until: Option<String>,
    },

    /// Verify stored evidence packages
    VerifyEvidence {
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Export the audit log as JSON lines
    Export {
        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(long)]
        no_hash: bool,
        #[arg(long)]
        no_details: bool,
    },
}

fn init_tracing(default_filter: &str) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

async fn open_audit(config: &AppConfig) -> Result<AuditLogger> {
    let db = Database::new(&config.database_url).await?;
    db.run_migrations().await?;
    Ok(AuditLogger::new(db, config.audit_secret.clone().into_bytes())?)
}

async fn open_evidence(config: &AppConfig) -> Result<EvidenceLedger> {
    if !config.key_path.exists() {
        bail!("No signing key at {:?}; run `clinical-ledger keygen` first", config.key_path);
    }
    let keys = KeyManager::load_or_create(&config.key_path)?;
    let blobs = FsBlobStore::new(&config.blob_root).await?;
    let db = Database::new(&config.database_url).await?;
    db.run_migrations().await?;
    Ok(EvidenceLedger::new(db, Arc::new(blobs), Arc::new(keys), config.blob_timeout()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config.log_filter);

    match cli.command {
        Commands::Keygen => {
            let existed = config.key_path.exists();
            let keys = KeyManager::load_or_create(&config.key_path)?;
            let key_id = keys.active_key_id().unwrap_or_default();
            if existed {
                println!("Signing key already present: {}", key_id);
            } else {
                println!("Created signing key {} at {}", key_id, config.key_path.display());
            }
            println!("Public key: {}", keys.active_public_key().unwrap_or_default());
        }

        Commands::RotateKey => {
            if !config.key_path.exists() {
                bail!("No signing key at {:?} to rotate", config.key_path);
            }
            let keys = KeyManager::load_or_create(&config.key_path)?;
            let previous = keys.active_key_id().unwrap_or_default();
            let new_id = keys.rotate()?;
            println!("Retired {}, now signing with {}", previous, new_id);
        }

        Commands::VerifyAudit { start, end } => {
            let audit = open_audit(&config).await?;
            let result = audit.verify_range(start, end.unwrap_or(u64::MAX)).await?;
            println!("{}", result.summary());
            if !result.valid {
                let tampered = audit.find_tampered(start, result.end).await?;
                if !tampered.is_empty() {
                    println!("Records whose contents no longer match their hash: {:?}", tampered);
                }
                error!("Audit chain verification failed");
                std::process::exit(1);
            }
        }

        Commands::Checkpoint { start, end } => {
            let audit = open_audit(&config).await?;
            let checkpoint = audit.checkpoint(start, end.unwrap_or(u64::MAX)).await?;
            println!("{}", serde_json::to_string_pretty(&checkpoint)?);
        }

        Commands::Stats { since, until } => {
            let since = since.as_deref().map(canonical::parse_timestamp).transpose()?;
            let until = until.as_deref().map(canonical::parse_timestamp).transpose()?;
            let audit = open_audit(&config).await?;
            let stats = audit.statistics(since, until).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }

        Commands::VerifyEvidence { ids } => {
            let ledger = open_evidence(&config).await?;
            let result = ledger.verify_chain(&ids).await;
            for item in &result.items {
                let mark = if item.valid { "✓" } else { "✗" };
                match &item.error {
                    Some(e) => println!("{} {}: {}", mark, item.evidence_id, e),
                    None => println!(
                        "{} {}: hash_valid={} signature_valid={}",
                        mark, item.evidence_id, item.hash_valid, item.signature_valid
                    ),
                }
            }
            println!("{}/{} valid", result.valid_count, result.total);
            if !result.overall_valid {
                std::process::exit(1);
            }
        }

        Commands::Export {
            output,
            no_hash,
            no_details,
        } => {
            let audit = open_audit(&config).await?;
            let options = ExportOptions {
                include_hash: !no_hash,
                include_details: !no_details,
            };
            let mut writer: Box<dyn Write> = match &output {
                Some(path) => Box::new(BufWriter::new(
                    File::create(path).with_context(|| format!("Failed to create {:?}", path))?,
                )),
                None => Box::new(BufWriter::new(io::stdout().lock())),
            };
            let written = audit.export(&AuditFilter::default(), options, &mut writer).await?;
            if output.is_some() {
                info!("Wrote {} records", written);
            }
        }
    }

    Ok(())
}
