//! Keys for exercising the engine without real key material.

use super::{Key, KeyError, KeyResult, KeyVersion};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Reversible key: ciphertext is the base64 encoding of the plaintext.
#[derive(Debug, Clone)]
pub struct TestKey {
    version: KeyVersion,
}

impl TestKey {
    pub fn new() -> Self {
        Self::with_version("1")
    }

    pub fn with_version(version: impl Into<String>) -> Self {
        Self {
            version: KeyVersion::new("testkey", "testkey", version),
        }
    }
}

impl Default for TestKey {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Key for TestKey {
    async fn version(&self) -> KeyResult<KeyVersion> {
        Ok(self.version.clone())
    }

    async fn encrypt(&self, plaintext: &[u8]) -> KeyResult<Vec<u8>> {
        Ok(STANDARD.encode(plaintext).into_bytes())
    }

    async fn decrypt(&self, ciphertext: &[u8]) -> KeyResult<Vec<u8>> {
        STANDARD
            .decode(ciphertext)
            .map_err(|e| KeyError::new(format!("corrupted ciphertext: {}", e)))
    }
}

/// Behaves like [`TestKey`] until `succeed` cipher calls have been made,
/// then fails every call.
#[derive(Debug)]
pub struct FailingKey {
    inner: TestKey,
    succeed: usize,
    calls: AtomicUsize,
}

impl FailingKey {
    pub fn after(succeed: usize) -> Self {
        Self {
            inner: TestKey::new(),
            succeed,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn tick(&self) -> KeyResult<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call >= self.succeed {
            return Err(KeyError::new(format!("injected failure on call {}", call + 1)));
        }
        Ok(())
    }
}

#[async_trait]
impl Key for FailingKey {
    async fn version(&self) -> KeyResult<KeyVersion> {
        self.inner.version().await
    }

    async fn encrypt(&self, plaintext: &[u8]) -> KeyResult<Vec<u8>> {
        self.tick()?;
        self.inner.encrypt(plaintext).await
    }

    async fn decrypt(&self, ciphertext: &[u8]) -> KeyResult<Vec<u8>> {
        self.tick()?;
        self.inner.decrypt(ciphertext).await
    }
}
