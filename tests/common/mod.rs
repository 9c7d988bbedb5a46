#![allow(dead_code)]

use async_trait::async_trait;
use colcrypt::core::Column;
use colcrypt::key::KeyResult;
use colcrypt::storage::TableSchema;
use colcrypt::{
    DataType, InMemoryStorage, Key, KeyVersion, TableEncryptionSpec, Value, static_key,
};
use std::sync::Arc;
use std::time::Duration;

/// Table `name` with columns `id`, `encryption_key_id` and one TEXT column
/// `secret`, filled with `secret-1..=rows`.
pub fn text_table(storage: &InMemoryStorage, name: &str, rows: i64) {
    storage
        .create_table(TableSchema::new(
            name,
            vec![
                Column::new("id", DataType::Integer).not_null(),
                Column::new("encryption_key_id", DataType::Text),
                Column::new("secret", DataType::Text),
            ],
        ))
        .unwrap();
    for id in 1..=rows {
        storage
            .insert_row(
                name,
                vec![Value::Integer(id), Value::Null, Value::Text(plaintext(id))],
            )
            .unwrap();
    }
}

pub fn plaintext(id: i64) -> String {
    format!("secret-{}", id)
}

pub fn text_spec(table: &str, batch_size: usize, key: Arc<dyn Key>) -> TableEncryptionSpec {
    TableEncryptionSpec::builder(table)
        .column("secret")
        .batch_size(batch_size)
        .key_provider(static_key(key))
        .build()
        .unwrap()
}

pub fn aes_key_bytes(seed: u8) -> Vec<u8> {
    (0..32u8).map(|b| b.wrapping_mul(7).wrapping_add(seed)).collect()
}

pub fn secret(storage: &InMemoryStorage, table: &str, id: i64) -> Value {
    storage.get_value(table, id, "secret").unwrap().unwrap()
}

pub fn key_id(storage: &InMemoryStorage, table: &str, id: i64) -> Value {
    storage.get_value(table, id, "encryption_key_id").unwrap().unwrap()
}

/// Wraps a key and yields (or sleeps) before every cipher call, so batches
/// running concurrently interleave.
pub struct SlowKey<K> {
    inner: K,
    delay: Option<Duration>,
}

impl<K: Key> SlowKey<K> {
    pub fn yielding(inner: K) -> Self {
        Self { inner, delay: None }
    }

    pub fn sleeping(inner: K, delay: Duration) -> Self {
        Self {
            inner,
            delay: Some(delay),
        }
    }

    async fn pause(&self) {
        match self.delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }
    }
}

#[async_trait]
impl<K: Key> Key for SlowKey<K> {
    async fn version(&self) -> KeyResult<KeyVersion> {
        self.inner.version().await
    }

    async fn encrypt(&self, plaintext: &[u8]) -> KeyResult<Vec<u8>> {
        self.pause().await;
        self.inner.encrypt(plaintext).await
    }

    async fn decrypt(&self, ciphertext: &[u8]) -> KeyResult<Vec<u8>> {
        self.pause().await;
        self.inner.decrypt(ciphertext).await
    }
}
