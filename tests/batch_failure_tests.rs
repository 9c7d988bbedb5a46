/// Batch failure tests
///
/// Every failure inside a batch must roll the whole batch back and release
/// its row locks.
/// Run with: cargo test --test batch_failure_tests
mod common;

use colcrypt::core::Column;
use colcrypt::key::testing::{FailingKey, TestKey};
use colcrypt::storage::TableSchema;
use colcrypt::{
    AesGcmKey, BatchCoordinator, ColumnScanner, DataType, Direction, ErrorKind, InMemoryStorage,
    MigrationError, MigrationRunner, ProgressCounter, Record, RecordScanner, Row, RunnerOptions,
    TableEncryptionSpec, Value, no_key, static_key,
};
use common::{SlowKey, aes_key_bytes, key_id, plaintext, secret, text_spec, text_table};
use std::sync::Arc;
use std::time::Duration;

fn engine(storage: &InMemoryStorage) -> (BatchCoordinator, ProgressCounter) {
    let store = Arc::new(storage.clone());
    (BatchCoordinator::new(store.clone()), ProgressCounter::new(store))
}

#[tokio::test]
async fn test_cipher_failure_rolls_back_batch() {
    let storage = InMemoryStorage::new();
    text_table(&storage, "webhooks", 5);
    let (coordinator, counter) = engine(&storage);
    let spec = text_spec("webhooks", 5, Arc::new(FailingKey::after(3)));

    let err = coordinator.encrypt_batch(&spec).await.unwrap_err();
    match &err {
        MigrationError::Cipher { table, id, .. } => {
            assert_eq!(table, "webhooks");
            assert_eq!(*id, 4);
        }
        other => panic!("expected cipher error, got {:?}", other),
    }
    assert_eq!(err.kind(), ErrorKind::Cipher);

    // Rows 1..=3 were encrypted in memory but never committed
    for id in 1..=5 {
        assert_eq!(secret(&storage, "webhooks", id), Value::Text(plaintext(id)));
        assert_eq!(key_id(&storage, "webhooks", id), Value::Null);
    }
    assert_eq!(counter.count(&spec).await.unwrap().unencrypted, 5);
    assert_eq!(storage.locked_rows("webhooks").unwrap(), 0);
}

#[tokio::test]
async fn test_wrong_key_on_decrypt() {
    let storage = InMemoryStorage::new();
    text_table(&storage, "webhooks", 2);
    let (coordinator, counter) = engine(&storage);

    let key = AesGcmKey::new("webhooks", "1", &aes_key_bytes(1)).unwrap();
    let spec = text_spec("webhooks", 5, Arc::new(key));
    coordinator.encrypt_batch(&spec).await.unwrap();
    let sealed = secret(&storage, "webhooks", 1);

    let other = AesGcmKey::new("webhooks", "2", &aes_key_bytes(9)).unwrap();
    let spec = spec.with_key_provider(static_key(Arc::new(other)));

    let err = coordinator.decrypt_batch(&spec).await.unwrap_err();
    assert!(matches!(err, MigrationError::Cipher { id: 1, .. }));
    assert_eq!(secret(&storage, "webhooks", 1), sealed);
    assert_eq!(counter.count(&spec).await.unwrap().encrypted, 2);
}

#[tokio::test]
async fn test_decrypt_without_key() {
    let storage = InMemoryStorage::new();
    text_table(&storage, "webhooks", 3);
    let (coordinator, counter) = engine(&storage);
    let spec = text_spec("webhooks", 5, Arc::new(TestKey::new()));

    let keyless = spec.with_key_provider(no_key());
    // Nothing to decrypt yet, so the missing key does not matter
    assert_eq!(coordinator.decrypt_batch(&keyless).await.unwrap(), 0);

    coordinator.encrypt_batch(&spec).await.unwrap();
    let err = coordinator.decrypt_batch(&keyless).await.unwrap_err();
    assert!(matches!(err, MigrationError::MissingKey(ref table) if table == "webhooks"));
    assert!(!err.is_retryable());
    assert_eq!(counter.count(&spec).await.unwrap().encrypted, 3);
    assert_eq!(storage.locked_rows("webhooks").unwrap(), 0);
}

#[tokio::test]
async fn test_malformed_row_is_a_decode_error() {
    let storage = InMemoryStorage::new();
    storage
        .create_table(TableSchema::new(
            "webhooks",
            vec![
                Column::new("id", DataType::Integer).not_null(),
                Column::new("encryption_key_id", DataType::Text),
                Column::new("secret", DataType::Bytes),
            ],
        ))
        .unwrap();
    storage
        .insert_row(
            "webhooks",
            vec![Value::Integer(1), Value::Null, Value::Bytes(b"raw".to_vec())],
        )
        .unwrap();
    let (coordinator, _) = engine(&storage);
    // Spec says text, table holds bytes
    let spec = text_spec("webhooks", 5, Arc::new(TestKey::new()));

    let err = coordinator.encrypt_batch(&spec).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Decode);
    assert_eq!(key_id(&storage, "webhooks", 1), Value::Null);
    assert_eq!(storage.locked_rows("webhooks").unwrap(), 0);
}

#[tokio::test]
async fn test_null_value_without_null_flag_is_a_decode_error() {
    let storage = InMemoryStorage::new();
    text_table(&storage, "webhooks", 2);
    storage
        .update_row("webhooks", 2, &[("secret".into(), Value::Null)])
        .unwrap();
    let (coordinator, _) = engine(&storage);
    let spec = text_spec("webhooks", 5, Arc::new(TestKey::new()));

    let err = coordinator.encrypt_batch(&spec).await.unwrap_err();
    assert!(matches!(err, MigrationError::Decode { .. }));
    // Row 1 decoded fine but the batch is all or nothing
    assert_eq!(key_id(&storage, "webhooks", 1), Value::Null);
}

/// Drops every value after the first.
struct TruncatingScanner;

impl RecordScanner for TruncatingScanner {
    fn scan(&self, spec: &TableEncryptionSpec, row: &Row) -> colcrypt::Result<Record> {
        let mut record = ColumnScanner.scan(spec, row)?;
        record.values.truncate(1);
        Ok(record)
    }
}

/// Reports every row as already encrypted.
struct MislabelingScanner;

impl RecordScanner for MislabelingScanner {
    fn scan(&self, spec: &TableEncryptionSpec, row: &Row) -> colcrypt::Result<Record> {
        let mut record = ColumnScanner.scan(spec, row)?;
        record.key_id = "forged".into();
        Ok(record)
    }
}

fn two_column_table(storage: &InMemoryStorage, rows: i64) {
    storage
        .create_table(TableSchema::new(
            "webhooks",
            vec![
                Column::new("id", DataType::Integer).not_null(),
                Column::new("encryption_key_id", DataType::Text),
                Column::new("secret", DataType::Text),
                Column::new("url", DataType::Text),
            ],
        ))
        .unwrap();
    for id in 1..=rows {
        storage
            .insert_row(
                "webhooks",
                vec![
                    Value::Integer(id),
                    Value::Null,
                    Value::Text(plaintext(id)),
                    Value::Text(format!("https://hooks.test/{}", id)),
                ],
            )
            .unwrap();
    }
}

fn two_column_spec(scanner: Arc<dyn RecordScanner>) -> TableEncryptionSpec {
    TableEncryptionSpec::builder("webhooks")
        .columns(["secret", "url"])
        .batch_size(5)
        .key_provider(static_key(Arc::new(TestKey::new())))
        .scanner(scanner)
        .build()
        .unwrap()
}

fn url(storage: &InMemoryStorage, id: i64) -> Value {
    storage.get_value("webhooks", id, "url").unwrap().unwrap()
}

#[tokio::test]
async fn test_partial_record_is_never_written() {
    let storage = InMemoryStorage::new();
    two_column_table(&storage, 3);
    let (coordinator, counter) = engine(&storage);
    let spec = two_column_spec(Arc::new(TruncatingScanner));

    let err = coordinator.encrypt_batch(&spec).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Decode);
    assert!(err.to_string().contains("row 1: expected 2 values, got 1"));
    for id in 1..=3 {
        assert_eq!(key_id(&storage, "webhooks", id), Value::Null);
        assert_eq!(secret(&storage, "webhooks", id), Value::Text(plaintext(id)));
        assert_eq!(url(&storage, id), Value::Text(format!("https://hooks.test/{}", id)));
    }
    assert_eq!(counter.count(&spec).await.unwrap().unencrypted, 3);
    assert_eq!(storage.locked_rows("webhooks").unwrap(), 0);

    // Same guard on the way back
    let full = two_column_spec(Arc::new(ColumnScanner));
    assert_eq!(coordinator.encrypt_batch(&full).await.unwrap(), 3);
    let sealed_url = url(&storage, 2);

    let err = coordinator.decrypt_batch(&spec).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Decode);
    assert_eq!(url(&storage, 2), sealed_url);
    assert_eq!(counter.count(&spec).await.unwrap().encrypted, 3);
}

#[tokio::test]
async fn test_record_state_must_match_claim() {
    let storage = InMemoryStorage::new();
    two_column_table(&storage, 2);
    let (coordinator, _) = engine(&storage);
    let spec = two_column_spec(Arc::new(MislabelingScanner));

    let err = coordinator.encrypt_batch(&spec).await.unwrap_err();
    assert!(matches!(err, MigrationError::Decode { .. }));
    assert!(err.to_string().contains("scanned as migrated, claimed as unmigrated"));
    assert_eq!(key_id(&storage, "webhooks", 1), Value::Null);
    assert_eq!(storage.locked_rows("webhooks").unwrap(), 0);
}

#[tokio::test]
async fn test_corrupted_text_ciphertext() {
    let storage = InMemoryStorage::new();
    text_table(&storage, "webhooks", 2);
    let (coordinator, _) = engine(&storage);
    let spec = text_spec("webhooks", 5, Arc::new(TestKey::new()));
    coordinator.encrypt_batch(&spec).await.unwrap();

    storage
        .update_row("webhooks", 2, &[("secret".into(), Value::Text("%%% not base64".into()))])
        .unwrap();

    let err = coordinator.decrypt_batch(&spec).await.unwrap_err();
    assert!(matches!(err, MigrationError::Decode { .. }));
    assert_ne!(secret(&storage, "webhooks", 1), Value::Text(plaintext(1)));
}

#[tokio::test]
async fn test_write_failure_is_retryable() {
    let storage = InMemoryStorage::new();
    text_table(&storage, "webhooks", 4);
    storage.fail_writes_for("webhooks", 3).unwrap();
    let (coordinator, counter) = engine(&storage);
    let spec = text_spec("webhooks", 4, Arc::new(TestKey::new()));

    let err = coordinator.encrypt_batch(&spec).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(counter.count(&spec).await.unwrap().unencrypted, 4);
    assert_eq!(storage.locked_rows("webhooks").unwrap(), 0);

    // The retry re-selects exactly the same rows
    storage.clear_write_faults().unwrap();
    assert_eq!(coordinator.encrypt_batch(&spec).await.unwrap(), 4);
    assert_eq!(counter.count(&spec).await.unwrap().encrypted, 4);
}

#[tokio::test]
async fn test_timeout_rolls_back_and_releases_locks() {
    let storage = InMemoryStorage::new();
    text_table(&storage, "webhooks", 3);
    let slow = SlowKey::sleeping(TestKey::new(), Duration::from_millis(200));
    let spec = text_spec("webhooks", 3, Arc::new(slow));

    let runner = MigrationRunner::new(Arc::new(storage.clone())).with_options(RunnerOptions {
        batch_timeout: Some(Duration::from_millis(20)),
        ..RunnerOptions::default()
    });

    let err = runner.run_batch(&spec, Direction::ToEncrypt).await.unwrap_err();
    assert!(matches!(err, MigrationError::Timeout { .. }));
    assert!(err.is_retryable());
    assert_eq!(storage.locked_rows("webhooks").unwrap(), 0);
    assert_eq!(runner.progress(&spec).await.unwrap().unencrypted, 3);

    // Another worker can claim the rows straight away
    let fast = spec.with_key_provider(static_key(Arc::new(TestKey::new())));
    assert_eq!(runner.run_batch(&fast, Direction::ToEncrypt).await.unwrap(), 3);
}

#[tokio::test]
async fn test_spec_validation_happens_at_build_time() {
    let err = TableEncryptionSpec::builder("webhooks")
        .column("id")
        .build()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);

    let err = TableEncryptionSpec::builder("webhooks; DROP TABLE x")
        .column("secret")
        .build()
        .unwrap_err();
    assert!(matches!(err, MigrationError::InvalidSpec { .. }));
}
