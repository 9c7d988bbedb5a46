//! Work selection: which rows a batch claims, and how "migrated" is decided.
//!
//! [`MigrationState`] is the single definition of migration state. Claims,
//! counts and scanned records all go through it, so they can never disagree.

use crate::core::{DataType, MigrationError, Result, Value};
use crate::spec::TableEncryptionSpec;
use std::fmt;

/// Key-id of a row that has not been encrypted. A NULL key-id reads the same.
pub const UNMIGRATED_KEY_ID: &str = "";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MigrationState {
    Unmigrated,
    Migrated,
}

impl MigrationState {
    pub fn of(key_id: Option<&str>) -> Self {
        match key_id {
            None => Self::Unmigrated,
            Some(id) if id == UNMIGRATED_KEY_ID => Self::Unmigrated,
            Some(_) => Self::Migrated,
        }
    }

    pub fn matches(&self, key_id: Option<&str>) -> bool {
        Self::of(key_id) == *self
    }

    /// SQL form of [`matches`](Self::matches). `param` must be bound to
    /// [`UNMIGRATED_KEY_ID`].
    pub fn sql_predicate(&self, key_id_column: &str, param: &str) -> String {
        let op = match self {
            Self::Unmigrated => "=",
            Self::Migrated => "<>",
        };
        format!("COALESCE({}, {}) {} {}", quote_ident(key_id_column), param, op, param)
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unmigrated => write!(f, "unmigrated"),
            Self::Migrated => write!(f, "migrated"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    ToEncrypt,
    ToDecrypt,
}

impl Direction {
    /// State of the rows a batch in this direction claims.
    pub fn source_state(&self) -> MigrationState {
        match self {
            Self::ToEncrypt => MigrationState::Unmigrated,
            Self::ToDecrypt => MigrationState::Migrated,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ToEncrypt => write!(f, "encrypt"),
            Self::ToDecrypt => write!(f, "decrypt"),
        }
    }
}

/// A bounded, skip-locked claim of rows in one migration state.
///
/// Result rows use the layout `[id, key_id, value columns..]`, ordered by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimQuery {
    pub table: String,
    pub id_column: String,
    pub key_id_column: String,
    pub value_columns: Vec<String>,
    pub value_type: DataType,
    pub state: MigrationState,
    pub limit: usize,
}

impl ClaimQuery {
    pub fn columns(&self) -> Vec<&str> {
        let mut columns = Vec::with_capacity(self.value_columns.len() + 2);
        columns.push(self.id_column.as_str());
        columns.push(self.key_id_column.as_str());
        columns.extend(self.value_columns.iter().map(String::as_str));
        columns
    }

    /// Postgres rendering; `$1` binds [`UNMIGRATED_KEY_ID`].
    pub fn to_sql(&self) -> String {
        let columns = self
            .columns()
            .into_iter()
            .map(quote_ident)
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "SELECT {} FROM {} WHERE {} ORDER BY {} ASC LIMIT {} FOR UPDATE SKIP LOCKED",
            columns,
            quote_ident(&self.table),
            self.state.sql_predicate(&self.key_id_column, "$1"),
            quote_ident(&self.id_column),
            self.limit
        )
    }
}

/// Build the claim for one batch of `spec` in `direction`.
pub fn select(spec: &TableEncryptionSpec, direction: Direction) -> ClaimQuery {
    ClaimQuery {
        table: spec.table().to_string(),
        id_column: spec.id_column().to_string(),
        key_id_column: spec.key_id_column().to_string(),
        value_columns: spec.encrypted_columns().to_vec(),
        value_type: spec.value_type(),
        state: direction.source_state(),
        limit: spec.batch_size(),
    }
}

/// Unlocked count of the rows in one migration state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountQuery {
    pub table: String,
    pub key_id_column: String,
    pub state: MigrationState,
}

impl CountQuery {
    pub fn new(spec: &TableEncryptionSpec, state: MigrationState) -> Self {
        Self {
            table: spec.table().to_string(),
            key_id_column: spec.key_id_column().to_string(),
            state,
        }
    }

    /// Postgres rendering; `$1` binds [`UNMIGRATED_KEY_ID`].
    pub fn to_sql(&self) -> String {
        format!(
            "SELECT COUNT(*) FROM {} WHERE {}",
            quote_ident(&self.table),
            self.state.sql_predicate(&self.key_id_column, "$1")
        )
    }
}

/// Write-back of one row: every encrypted column plus the key-id, keyed by
/// primary key only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowUpdate {
    pub table: String,
    pub id_column: String,
    pub id: i64,
    pub value_type: DataType,
    pub assignments: Vec<(String, Value)>,
    pub key_id_column: String,
    pub key_id: String,
}

impl RowUpdate {
    /// Fails unless there is exactly one value per encrypted column, so a
    /// row is never written back with some columns left behind.
    pub fn new(
        spec: &TableEncryptionSpec,
        id: i64,
        values: Vec<Value>,
        key_id: String,
    ) -> Result<Self> {
        let columns = spec.encrypted_columns();
        if values.len() != columns.len() {
            return Err(MigrationError::decode(
                spec.table(),
                format!("row {}: expected {} values, got {}", id, columns.len(), values.len()),
            ));
        }

        Ok(Self {
            table: spec.table().to_string(),
            id_column: spec.id_column().to_string(),
            id,
            value_type: spec.value_type(),
            assignments: columns.iter().cloned().zip(values).collect(),
            key_id_column: spec.key_id_column().to_string(),
            key_id,
        })
    }

    /// Postgres rendering. Binds are the assigned values in order, then the
    /// key-id, then the row id.
    pub fn to_sql(&self) -> String {
        let mut sets: Vec<String> = self
            .assignments
            .iter()
            .enumerate()
            .map(|(i, (column, _))| format!("{} = ${}", quote_ident(column), i + 1))
            .collect();
        let n = self.assignments.len();
        sets.push(format!("{} = ${}", quote_ident(&self.key_id_column), n + 1));

        format!(
            "UPDATE {} SET {} WHERE {} = ${}",
            quote_ident(&self.table),
            sets.join(", "),
            quote_ident(&self.id_column),
            n + 2
        )
    }
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
