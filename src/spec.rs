use crate::core::{DataType, MigrationError, Result};
use crate::key::{Key, KeyProvider, no_key};
use crate::record::{ColumnScanner, RecordScanner};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

pub const DEFAULT_ID_COLUMN: &str = "id";
pub const DEFAULT_KEY_ID_COLUMN: &str = "encryption_key_id";
pub const DEFAULT_BATCH_SIZE: usize = 50;

lazy_static! {
    static ref IDENTIFIER: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex");
}

/// Immutable description of one encryptable table.
///
/// Built once at startup and shared read-only between every batch that
/// touches the table. All per-table behaviour (nullability, byte or text
/// storage, row decoding, the active key) is carried here, so the engine
/// itself has no table-specific code.
#[derive(Clone)]
pub struct TableEncryptionSpec {
    table: String,
    id_column: String,
    key_id_column: String,
    columns: Vec<String>,
    treat_empty_as_null: bool,
    store_as_bytes: bool,
    batch_size: usize,
    key_provider: KeyProvider,
    scanner: Arc<dyn RecordScanner>,
}

impl TableEncryptionSpec {
    pub fn builder(table: impl Into<String>) -> TableEncryptionSpecBuilder {
        TableEncryptionSpecBuilder::new(table)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn id_column(&self) -> &str {
        &self.id_column
    }

    pub fn key_id_column(&self) -> &str {
        &self.key_id_column
    }

    pub fn encrypted_columns(&self) -> &[String] {
        &self.columns
    }

    pub fn treat_empty_as_null(&self) -> bool {
        self.treat_empty_as_null
    }

    pub fn store_as_bytes(&self) -> bool {
        self.store_as_bytes
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Storage type of the encrypted value columns.
    pub fn value_type(&self) -> DataType {
        if self.store_as_bytes {
            DataType::Bytes
        } else {
            DataType::Text
        }
    }

    /// Resolve the active key. Called fresh for every batch so a rotation
    /// mid-migration is picked up by the next batch.
    pub fn key(&self) -> Option<Arc<dyn Key>> {
        (self.key_provider)()
    }

    pub fn scanner(&self) -> &dyn RecordScanner {
        self.scanner.as_ref()
    }

    /// Return a copy of this spec bound to a different key provider.
    pub fn with_key_provider(&self, key_provider: KeyProvider) -> Self {
        Self {
            key_provider,
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| MigrationError::invalid_spec(&self.table, reason);

        for (role, name) in [
            ("table", &self.table),
            ("id column", &self.id_column),
            ("key-id column", &self.key_id_column),
        ] {
            if !IDENTIFIER.is_match(name) {
                return Err(invalid(format!("{} name '{}' is not a valid identifier", role, name)));
            }
        }

        if self.id_column == self.key_id_column {
            return Err(invalid("id column and key-id column must differ".into()));
        }

        if self.columns.is_empty() {
            return Err(invalid("at least one encrypted column is required".into()));
        }

        let mut seen = HashSet::new();
        for column in &self.columns {
            if !IDENTIFIER.is_match(column) {
                return Err(invalid(format!("column name '{}' is not a valid identifier", column)));
            }
            if column == &self.id_column || column == &self.key_id_column {
                return Err(invalid(format!(
                    "column '{}' cannot be both encrypted and an id/key-id column",
                    column
                )));
            }
            if !seen.insert(column.as_str()) {
                return Err(invalid(format!("column '{}' is listed twice", column)));
            }
        }

        if self.batch_size == 0 {
            return Err(invalid("batch size must be positive".into()));
        }

        Ok(())
    }
}

impl fmt::Debug for TableEncryptionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableEncryptionSpec")
            .field("table", &self.table)
            .field("id_column", &self.id_column)
            .field("key_id_column", &self.key_id_column)
            .field("columns", &self.columns)
            .field("treat_empty_as_null", &self.treat_empty_as_null)
            .field("store_as_bytes", &self.store_as_bytes)
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

pub struct TableEncryptionSpecBuilder {
    spec: TableEncryptionSpec,
}

impl TableEncryptionSpecBuilder {
    fn new(table: impl Into<String>) -> Self {
        Self {
            spec: TableEncryptionSpec {
                table: table.into(),
                id_column: DEFAULT_ID_COLUMN.to_string(),
                key_id_column: DEFAULT_KEY_ID_COLUMN.to_string(),
                columns: Vec::new(),
                treat_empty_as_null: false,
                store_as_bytes: false,
                batch_size: DEFAULT_BATCH_SIZE,
                key_provider: no_key(),
                scanner: Arc::new(ColumnScanner),
            },
        }
    }

    pub fn id_column(mut self, name: impl Into<String>) -> Self {
        self.spec.id_column = name.into();
        self
    }

    pub fn key_id_column(mut self, name: impl Into<String>) -> Self {
        self.spec.key_id_column = name.into();
        self
    }

    /// Append an encrypted column. Order is significant: it fixes the order
    /// of values in every [`Record`](crate::record::Record).
    pub fn column(mut self, name: impl Into<String>) -> Self {
        self.spec.columns.push(name.into());
        self
    }

    pub fn columns<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec.columns.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn treat_empty_as_null(mut self, enabled: bool) -> Self {
        self.spec.treat_empty_as_null = enabled;
        self
    }

    pub fn store_as_bytes(mut self, enabled: bool) -> Self {
        self.spec.store_as_bytes = enabled;
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.spec.batch_size = size;
        self
    }

    pub fn key_provider(mut self, provider: KeyProvider) -> Self {
        self.spec.key_provider = provider;
        self
    }

    pub fn scanner(mut self, scanner: Arc<dyn RecordScanner>) -> Self {
        self.spec.scanner = scanner;
        self
    }

    pub fn build(self) -> Result<TableEncryptionSpec> {
        self.spec.validate()?;
        Ok(self.spec)
    }
}
