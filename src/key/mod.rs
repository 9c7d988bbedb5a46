//! The Key capability consumed by the migration engine.
//!
//! The engine never looks inside a key: it asks for its version (which is
//! persisted as the row's key-id) and hands it plaintext or ciphertext bytes.

pub mod aes;
pub mod testing;

pub use aes::AesGcmKey;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct KeyError(String);

impl KeyError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub type KeyResult<T> = std::result::Result<T, KeyError>;

/// Identity of a key, persisted in the key-id column as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyVersion {
    #[serde(rename = "type")]
    pub key_type: String,
    pub name: String,
    pub version: String,
}

impl KeyVersion {
    pub fn new(
        key_type: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            key_type: key_type.into(),
            name: name.into(),
            version: version.into(),
        }
    }

    pub fn to_json(&self) -> String {
        // Serializing three strings cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl fmt::Display for KeyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.key_type, self.name, self.version)
    }
}

#[async_trait]
pub trait Key: Send + Sync {
    async fn version(&self) -> KeyResult<KeyVersion>;

    async fn encrypt(&self, plaintext: &[u8]) -> KeyResult<Vec<u8>>;

    /// Implementations are expected to pick the historical key that produced
    /// `ciphertext` when it differs from the current one.
    async fn decrypt(&self, ciphertext: &[u8]) -> KeyResult<Vec<u8>>;
}

/// Resolves the active key for a table. `None` means no key is configured.
pub type KeyProvider = Arc<dyn Fn() -> Option<Arc<dyn Key>> + Send + Sync>;

pub fn static_key(key: Arc<dyn Key>) -> KeyProvider {
    Arc::new(move || Some(Arc::clone(&key)))
}

pub fn no_key() -> KeyProvider {
    Arc::new(|| None)
}
