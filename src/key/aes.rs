//! AES-256-GCM key adapter

use super::{Key, KeyError, KeyResult, KeyVersion};
use aes_gcm::{
    Aes256Gcm, Key as AesKey, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const KEY_TYPE: &str = "aes-256-gcm";

/// Ciphertext layout: 12-byte random nonce followed by the sealed payload.
///
/// Previous keys are only used for decryption, so rows sealed before a
/// rotation keep decrypting while new writes use the current key.
pub struct AesGcmKey {
    name: String,
    version: String,
    current: Aes256Gcm,
    previous: Vec<Aes256Gcm>,
}

impl AesGcmKey {
    pub fn new(name: impl Into<String>, version: impl Into<String>, key: &[u8]) -> KeyResult<Self> {
        Ok(Self {
            name: name.into(),
            version: version.into(),
            current: cipher_for(key)?,
            previous: Vec::new(),
        })
    }

    pub fn from_base64(
        name: impl Into<String>,
        version: impl Into<String>,
        encoded: &str,
    ) -> KeyResult<Self> {
        let key = decode_key(encoded)?;
        Self::new(name, version, &key)
    }

    /// Accept ciphertext produced by an older key.
    pub fn with_previous(mut self, key: &[u8]) -> KeyResult<Self> {
        self.previous.push(cipher_for(key)?);
        Ok(self)
    }

    pub fn with_previous_base64(self, encoded: &str) -> KeyResult<Self> {
        let key = decode_key(encoded)?;
        self.with_previous(&key)
    }
}

fn cipher_for(key: &[u8]) -> KeyResult<Aes256Gcm> {
    if key.len() != KEY_LEN {
        return Err(KeyError::new(format!(
            "key must be {} bytes for AES-256, got {}",
            KEY_LEN,
            key.len()
        )));
    }
    Ok(Aes256Gcm::new(AesKey::<Aes256Gcm>::from_slice(key)))
}

fn decode_key(encoded: &str) -> KeyResult<Vec<u8>> {
    STANDARD
        .decode(encoded.trim())
        .map_err(|e| KeyError::new(format!("invalid base64 key: {}", e)))
}

#[async_trait]
impl Key for AesGcmKey {
    async fn version(&self) -> KeyResult<KeyVersion> {
        Ok(KeyVersion::new(KEY_TYPE, &self.name, &self.version))
    }

    async fn encrypt(&self, plaintext: &[u8]) -> KeyResult<Vec<u8>> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self
            .current
            .encrypt(&nonce, plaintext)
            .map_err(|e| KeyError::new(format!("encryption failed: {}", e)))?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    async fn decrypt(&self, ciphertext: &[u8]) -> KeyResult<Vec<u8>> {
        if ciphertext.len() < NONCE_LEN {
            return Err(KeyError::new(format!(
                "ciphertext too short: {} bytes",
                ciphertext.len()
            )));
        }
        let (nonce, sealed) = ciphertext.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce);

        std::iter::once(&self.current)
            .chain(self.previous.iter())
            .find_map(|cipher| cipher.decrypt(nonce, sealed).ok())
            .ok_or_else(|| KeyError::new("decryption failed: no matching key"))
    }
}
