//! Row decoding and value encoding for a batch.
//!
//! Claimed rows arrive in a fixed layout: `[id, key_id, value_1, .., value_n]`
//! with the values in the order of the table's encrypted columns.

use crate::core::{MigrationError, Result, Row, Value};
use crate::selector::MigrationState;
use crate::spec::TableEncryptionSpec;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// One row in flight. Values are raw bytes: UTF-8 text for text columns,
/// the stored bytes for byte columns. NULL is read as empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub id: i64,
    pub key_id: String,
    pub values: Vec<Vec<u8>>,
}

impl Record {
    pub fn state(&self) -> MigrationState {
        MigrationState::of(Some(self.key_id.as_str()))
    }
}

/// Decodes one claimed row into a [`Record`].
///
/// Pluggable per table because column representation differs; a scanner must
/// either decode every column or fail the whole row.
pub trait RecordScanner: Send + Sync {
    fn scan(&self, spec: &TableEncryptionSpec, row: &Row) -> Result<Record>;
}

/// Default scanner driven entirely by the table's flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct ColumnScanner;

impl RecordScanner for ColumnScanner {
    fn scan(&self, spec: &TableEncryptionSpec, row: &Row) -> Result<Record> {
        let expected = spec.encrypted_columns().len() + 2;
        if row.len() != expected {
            return Err(MigrationError::decode(
                spec.table(),
                format!("expected {} columns, got {}", expected, row.len()),
            ));
        }

        let id = row[0].as_i64().ok_or_else(|| {
            MigrationError::decode(
                spec.table(),
                format!("{} must be INTEGER, got {}", spec.id_column(), row[0].type_name()),
            )
        })?;

        let key_id = match &row[1] {
            Value::Null => String::new(),
            Value::Text(s) => s.clone(),
            other => {
                return Err(MigrationError::decode(
                    spec.table(),
                    format!(
                        "row {}: {} must be TEXT, got {}",
                        id,
                        spec.key_id_column(),
                        other.type_name()
                    ),
                ));
            }
        };

        let values = spec
            .encrypted_columns()
            .iter()
            .zip(&row[2..])
            .map(|(column, value)| decode_value(spec, id, column, value))
            .collect::<Result<Vec<_>>>()?;

        Ok(Record { id, key_id, values })
    }
}

fn decode_value(spec: &TableEncryptionSpec, id: i64, column: &str, value: &Value) -> Result<Vec<u8>> {
    match (value, spec.store_as_bytes()) {
        (Value::Null, _) if spec.treat_empty_as_null() => Ok(Vec::new()),
        (Value::Bytes(b), true) => Ok(b.clone()),
        (Value::Text(s), false) => Ok(s.clone().into_bytes()),
        (other, _) => Err(MigrationError::decode(
            spec.table(),
            format!(
                "row {}: column {} expects {}, got {}",
                id,
                column,
                spec.value_type(),
                other.type_name()
            ),
        )),
    }
}

/// Column value for freshly encrypted data. Text columns hold base64.
pub fn ciphertext_to_column(spec: &TableEncryptionSpec, ciphertext: Vec<u8>) -> Value {
    if spec.store_as_bytes() {
        Value::Bytes(ciphertext)
    } else {
        Value::Text(STANDARD.encode(ciphertext))
    }
}

/// Inverse of [`ciphertext_to_column`] applied to a scanned value.
pub fn column_to_ciphertext(spec: &TableEncryptionSpec, id: i64, stored: &[u8]) -> Result<Vec<u8>> {
    if spec.store_as_bytes() {
        return Ok(stored.to_vec());
    }
    STANDARD.decode(stored).map_err(|e| {
        MigrationError::decode(spec.table(), format!("row {}: ciphertext is not base64: {}", id, e))
    })
}

/// Column value for decrypted data.
pub fn plaintext_to_column(spec: &TableEncryptionSpec, id: i64, plaintext: Vec<u8>) -> Result<Value> {
    if spec.store_as_bytes() {
        return Ok(Value::Bytes(plaintext));
    }
    String::from_utf8(plaintext).map(Value::Text).map_err(|e| {
        MigrationError::decode(spec.table(), format!("row {}: plaintext is not UTF-8: {}", id, e))
    })
}
