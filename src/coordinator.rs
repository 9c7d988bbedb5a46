// ============================================================================
// Batch Coordinator
// ============================================================================
//
// One migration step: open a transaction, claim a batch, run every value
// through the key, write values and key-id back, commit. Any failure rolls
// the whole batch back, so a row never ends up with ciphertext and key-id
// out of step.
//
// ============================================================================

use crate::core::{MigrationError, Result, Row, Value};
use crate::key::{Key, KeyError};
use crate::record::{Record, ciphertext_to_column, column_to_ciphertext, plaintext_to_column};
use crate::selector::{Direction, RowUpdate, UNMIGRATED_KEY_ID, select};
use crate::spec::TableEncryptionSpec;
use crate::store::{MigrationStore, MigrationTx};
use std::sync::Arc;
use tracing::{Instrument, debug, info, info_span, warn};

#[derive(Clone)]
pub struct BatchCoordinator {
    store: Arc<dyn MigrationStore>,
}

impl BatchCoordinator {
    pub fn new(store: Arc<dyn MigrationStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn MigrationStore> {
        &self.store
    }

    pub async fn run_batch(&self, spec: &TableEncryptionSpec, direction: Direction) -> Result<usize> {
        match direction {
            Direction::ToEncrypt => self.encrypt_batch(spec).await,
            Direction::ToDecrypt => self.decrypt_batch(spec).await,
        }
    }

    /// Encrypt up to one batch of unmigrated rows. Returns the number of rows
    /// migrated; `0` means nothing was left or no key is configured.
    pub async fn encrypt_batch(&self, spec: &TableEncryptionSpec) -> Result<usize> {
        let span = info_span!("batch", table = %spec.table(), direction = %Direction::ToEncrypt);
        self.encrypt(spec).instrument(span).await
    }

    /// Decrypt up to one batch of migrated rows, resetting their key-id to
    /// the sentinel.
    pub async fn decrypt_batch(&self, spec: &TableEncryptionSpec) -> Result<usize> {
        let span = info_span!("batch", table = %spec.table(), direction = %Direction::ToDecrypt);
        self.decrypt(spec).instrument(span).await
    }

    async fn encrypt(&self, spec: &TableEncryptionSpec) -> Result<usize> {
        let Some(key) = spec.key() else {
            debug!("no active key, skipping");
            return Ok(0);
        };
        let key_id = key
            .version()
            .await
            .map_err(|source| MigrationError::KeyVersion {
                table: spec.table().to_string(),
                source,
            })?
            .to_json();

        let mut tx = self.store.begin().await?;
        let outcome = encrypt_rows(tx.as_mut(), spec, key.as_ref(), &key_id).await;
        finish(tx, outcome).await
    }

    async fn decrypt(&self, spec: &TableEncryptionSpec) -> Result<usize> {
        let mut tx = self.store.begin().await?;
        let outcome = decrypt_rows(tx.as_mut(), spec).await;
        finish(tx, outcome).await
    }
}

async fn finish(tx: Box<dyn MigrationTx>, outcome: Result<usize>) -> Result<usize> {
    match outcome {
        Ok(rows) => {
            if let Err(err) = tx.commit().await {
                warn!(error = %err, "commit failed");
                return Err(err);
            }
            if rows > 0 {
                info!(rows, "batch committed");
            }
            Ok(rows)
        }
        Err(err) => {
            warn!(error = %err, "rolling back batch");
            if let Err(rollback) = tx.rollback().await {
                warn!(error = %rollback, "rollback failed");
            }
            Err(err)
        }
    }
}

fn cipher_error(spec: &TableEncryptionSpec, id: i64) -> impl FnOnce(KeyError) -> MigrationError + '_ {
    move |source| MigrationError::Cipher {
        table: spec.table().to_string(),
        id,
        source,
    }
}

/// Scan a claimed row, refusing records that do not cover every encrypted
/// column or whose key-id disagrees with the claim.
fn scan(spec: &TableEncryptionSpec, row: &Row, direction: Direction) -> Result<Record> {
    let record = spec.scanner().scan(spec, row)?;

    let expected = spec.encrypted_columns().len();
    if record.values.len() != expected {
        return Err(MigrationError::decode(
            spec.table(),
            format!("row {}: expected {} values, got {}", record.id, expected, record.values.len()),
        ));
    }
    if record.state() != direction.source_state() {
        return Err(MigrationError::decode(
            spec.table(),
            format!(
                "row {}: scanned as {}, claimed as {}",
                record.id,
                record.state(),
                direction.source_state()
            ),
        ));
    }
    Ok(record)
}

async fn encrypt_rows(
    tx: &mut dyn MigrationTx,
    spec: &TableEncryptionSpec,
    key: &dyn Key,
    key_id: &str,
) -> Result<usize> {
    let rows = tx.claim_batch(&select(spec, Direction::ToEncrypt)).await?;
    debug!(claimed = rows.len(), "claimed batch");

    for row in &rows {
        let record = scan(spec, row, Direction::ToEncrypt)?;

        let mut values = Vec::with_capacity(record.values.len());
        for plaintext in &record.values {
            if plaintext.is_empty() && spec.treat_empty_as_null() {
                values.push(Value::Null);
                continue;
            }
            let ciphertext = key
                .encrypt(plaintext)
                .await
                .map_err(cipher_error(spec, record.id))?;
            values.push(ciphertext_to_column(spec, ciphertext));
        }

        tx.write_back(&RowUpdate::new(spec, record.id, values, key_id.to_string())?)
            .await?;
    }

    Ok(rows.len())
}

async fn decrypt_rows(tx: &mut dyn MigrationTx, spec: &TableEncryptionSpec) -> Result<usize> {
    let rows = tx.claim_batch(&select(spec, Direction::ToDecrypt)).await?;
    debug!(claimed = rows.len(), "claimed batch");
    if rows.is_empty() {
        return Ok(0);
    }

    let key = spec
        .key()
        .ok_or_else(|| MigrationError::MissingKey(spec.table().to_string()))?;

    for row in &rows {
        let record = scan(spec, row, Direction::ToDecrypt)?;

        let mut values = Vec::with_capacity(record.values.len());
        for stored in &record.values {
            if stored.is_empty() && spec.treat_empty_as_null() {
                values.push(Value::Null);
                continue;
            }
            let ciphertext = column_to_ciphertext(spec, record.id, stored)?;
            let plaintext = key
                .decrypt(&ciphertext)
                .await
                .map_err(cipher_error(spec, record.id))?;
            if plaintext.is_empty() && spec.treat_empty_as_null() {
                values.push(Value::Null);
            } else {
                values.push(plaintext_to_column(spec, record.id, plaintext)?);
            }
        }

        tx.write_back(&RowUpdate::new(
            spec,
            record.id,
            values,
            UNMIGRATED_KEY_ID.to_string(),
        )?)
        .await?;
    }

    Ok(rows.len())
}
