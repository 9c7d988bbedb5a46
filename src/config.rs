//! File configuration.
//!
//! ```toml
//! [runner]
//! batch_delay_ms = 100
//! batch_timeout_ms = 30000
//! workers = 2
//!
//! [[tables]]
//! name = "webhooks"
//! columns = ["secret", "url"]
//! batch_size = 100
//!
//! [[tables]]
//! name = "user_credentials"
//! key_id_column = "key_id"
//! columns = ["credential"]
//! treat_empty_as_null = true
//! store_as_bytes = true
//! ```
//!
//! Key material never lives in this file; the caller supplies a
//! [`KeyProvider`] when turning the config into a [`SpecRegistry`].

use crate::core::{MigrationError, Result};
use crate::key::KeyProvider;
use crate::registry::SpecRegistry;
use crate::runner::RunnerOptions;
use crate::spec::{DEFAULT_BATCH_SIZE, DEFAULT_ID_COLUMN, DEFAULT_KEY_ID_COLUMN, TableEncryptionSpec};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MigrationConfig {
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub tables: Vec<TableConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableConfig {
    pub name: String,
    #[serde(default = "default_id_column")]
    pub id_column: String,
    #[serde(default = "default_key_id_column")]
    pub key_id_column: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub treat_empty_as_null: bool,
    #[serde(default)]
    pub store_as_bytes: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    #[serde(default)]
    pub batch_delay_ms: u64,
    #[serde(default)]
    pub batch_timeout_ms: Option<u64>,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            batch_delay_ms: 0,
            batch_timeout_ms: None,
            workers: default_workers(),
        }
    }
}

fn default_id_column() -> String {
    DEFAULT_ID_COLUMN.to_string()
}

fn default_key_id_column() -> String {
    DEFAULT_KEY_ID_COLUMN.to_string()
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_workers() -> usize {
    1
}

impl MigrationConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| MigrationError::Config(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            MigrationError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content).map_err(|e| match e {
            MigrationError::Config(reason) => {
                MigrationError::Config(format!("Failed to parse config file {}: {}", path.display(), reason))
            }
            other => other,
        })
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| MigrationError::Config(e.to_string()))
    }

    /// Build and validate every table spec, all bound to `provider`.
    pub fn into_registry(self, provider: KeyProvider) -> Result<SpecRegistry> {
        let mut registry = SpecRegistry::new();
        for table in self.tables {
            registry.register(table.into_spec(provider.clone())?)?;
        }
        Ok(registry)
    }
}

impl TableConfig {
    pub fn into_spec(self, provider: KeyProvider) -> Result<TableEncryptionSpec> {
        TableEncryptionSpec::builder(self.name)
            .id_column(self.id_column)
            .key_id_column(self.key_id_column)
            .columns(self.columns)
            .treat_empty_as_null(self.treat_empty_as_null)
            .store_as_bytes(self.store_as_bytes)
            .batch_size(self.batch_size)
            .key_provider(provider)
            .build()
    }
}

impl RunnerConfig {
    pub fn options(&self) -> RunnerOptions {
        RunnerOptions {
            batch_delay: Duration::from_millis(self.batch_delay_ms),
            batch_timeout: self.batch_timeout_ms.map(Duration::from_millis),
            max_batches: None,
        }
    }
}
