use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use colcrypt::{
    AesGcmKey, Direction, KeyProvider, MigrationConfig, MigrationRunner, PgMigrationStore,
    SpecRegistry, TableEncryptionSpec, no_key, static_key,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "colcrypt")]
#[command(about = "Encrypt or decrypt database columns in place, one batch at a time")]
struct Cli {
    /// TOML file listing the encryptable tables
    #[arg(long, short)]
    config: PathBuf,

    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    #[arg(long, default_value_t = 5)]
    max_connections: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show encrypted/unencrypted row counts per table
    Status {
        #[arg(long)]
        table: Option<String>,
    },
    Encrypt {
        #[arg(long)]
        table: Option<String>,
        /// Run a single batch per table instead of draining
        #[arg(long)]
        once: bool,
    },
    Decrypt {
        #[arg(long)]
        table: Option<String>,
        #[arg(long)]
        once: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("colcrypt=info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        error!("{:#}", err);
        return Err(err);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = MigrationConfig::from_file(&cli.config)?;
    let workers = config.runner.workers;
    let options = config.runner.options();
    let registry = config.into_registry(key_provider_from_env()?)?;

    info!(tables = registry.len(), "connecting to database");
    let store = PgMigrationStore::connect(&cli.database_url, cli.max_connections)
        .await
        .context("Failed to connect to database")?;
    let runner = MigrationRunner::new(Arc::new(store)).with_options(options);

    match cli.command {
        Command::Status { table } => {
            for spec in selected(&registry, table.as_deref())? {
                let progress = runner.progress(spec).await?;
                println!("{:<32} {}", spec.table(), progress);
            }
        }
        Command::Encrypt { table, once } => {
            migrate(&runner, &registry, table.as_deref(), Direction::ToEncrypt, once, workers).await?
        }
        Command::Decrypt { table, once } => {
            migrate(&runner, &registry, table.as_deref(), Direction::ToDecrypt, once, workers).await?
        }
    }
    Ok(())
}

async fn migrate(
    runner: &MigrationRunner,
    registry: &SpecRegistry,
    table: Option<&str>,
    direction: Direction,
    once: bool,
    workers: usize,
) -> Result<()> {
    for spec in selected(registry, table)? {
        if direction == Direction::ToEncrypt && spec.key().is_none() {
            warn!(table = %spec.table(), "no key configured, encryption is a no-op");
        }

        let rows = if once {
            runner.run_batch(spec, direction).await?
        } else {
            runner.run_workers(spec, direction, workers).await?.rows
        };

        let progress = runner.progress(spec).await?;
        println!("{:<32} {} rows ({}): {}", spec.table(), rows, direction, progress);
    }
    Ok(())
}

fn selected<'a>(registry: &'a SpecRegistry, table: Option<&str>) -> Result<Vec<&'a TableEncryptionSpec>> {
    match table {
        Some(name) => Ok(vec![registry.get(name)?]),
        None => Ok(registry.iter().collect()),
    }
}

/// `COLCRYPT_KEY` holds the current base64 AES-256 key; without it no key is
/// configured.
fn key_provider_from_env() -> Result<KeyProvider> {
    let Ok(encoded) = std::env::var("COLCRYPT_KEY") else {
        return Ok(no_key());
    };

    let name = std::env::var("COLCRYPT_KEY_NAME").unwrap_or_else(|_| "colcrypt".to_string());
    let version = std::env::var("COLCRYPT_KEY_VERSION").unwrap_or_else(|_| "1".to_string());

    let mut key = AesGcmKey::from_base64(name, version, encoded.trim())
        .map_err(|e| anyhow!("COLCRYPT_KEY: {}", e))?;

    if let Ok(previous) = std::env::var("COLCRYPT_PREVIOUS_KEYS") {
        for encoded in previous.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            key = key
                .with_previous_base64(encoded)
                .map_err(|e| anyhow!("COLCRYPT_PREVIOUS_KEYS: {}", e))?;
        }
    }

    Ok(static_key(Arc::new(key)))
}
