use crate::key::KeyError;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Invalid encryption spec for table '{table}': {reason}")]
    InvalidSpec { table: String, reason: String },

    #[error("Table '{0}' is already registered")]
    DuplicateTable(String),

    #[error("Table '{0}' is not registered")]
    UnknownTable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No encryption key configured for table '{0}'")]
    MissingKey(String),

    #[error("Cipher error on table '{table}' row {id}: {source}")]
    Cipher {
        table: String,
        id: i64,
        #[source]
        source: KeyError,
    },

    #[error("Could not read key version for table '{table}': {source}")]
    KeyVersion {
        table: String,
        #[source]
        source: KeyError,
    },

    #[error("Failed to decode row of table '{table}': {reason}")]
    Decode { table: String, reason: String },

    #[error("Database error: {0}")]
    Database(String),

    #[cfg(feature = "postgres")]
    #[error("Postgres error: {0}")]
    Postgres(#[from] sqlx::Error),

    #[error("Batch on table '{table}' timed out after {after:?}")]
    Timeout { table: String, after: Duration },

    #[error("Lock error: {0}")]
    LockError(String),
}

/// Coarse classification used by callers to pick a retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Cipher,
    Transient,
    Decode,
}

impl MigrationError {
    pub fn invalid_spec(table: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSpec {
            table: table.into(),
            reason: reason.into(),
        }
    }

    pub fn decode(table: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Decode {
            table: table.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidSpec { .. }
            | Self::DuplicateTable(_)
            | Self::UnknownTable(_)
            | Self::Config(_) => ErrorKind::Configuration,
            Self::MissingKey(_) | Self::Cipher { .. } | Self::KeyVersion { .. } => ErrorKind::Cipher,
            Self::Decode { .. } => ErrorKind::Decode,
            Self::Database(_) | Self::Timeout { .. } | Self::LockError(_) => ErrorKind::Transient,
            #[cfg(feature = "postgres")]
            Self::Postgres(err) => postgres_kind(err),
        }
    }

    /// A retried batch re-selects the same rows, so transient failures are safe to retry.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

pub type Result<T> = std::result::Result<T, MigrationError>;

// SQLSTATE codes that point at the table description rather than the server
#[cfg(feature = "postgres")]
const UNDEFINED_TABLE: &str = "42P01";
#[cfg(feature = "postgres")]
const UNDEFINED_COLUMN: &str = "42703";
#[cfg(feature = "postgres")]
const DATATYPE_MISMATCH: &str = "42804";

/// Values the driver cannot decode fail the same way on every retry.
#[cfg(feature = "postgres")]
fn postgres_kind(err: &sqlx::Error) -> ErrorKind {
    match err {
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnIndexOutOfBounds { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::TypeNotFound { .. } => ErrorKind::Decode,
        sqlx::Error::Database(db)
            if matches!(
                db.code().as_deref(),
                Some(UNDEFINED_TABLE | UNDEFINED_COLUMN | DATATYPE_MISMATCH)
            ) =>
        {
            ErrorKind::Configuration
        }
        _ => ErrorKind::Transient,
    }
}

impl<T> From<std::sync::PoisonError<T>> for MigrationError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}
