// ============================================================================
// colcrypt Library
// ============================================================================
//
// Incremental at-rest encryption of live database columns. Each table is
// described by a `TableEncryptionSpec`; one shared engine migrates any table
// in small, self-contained transactional batches that any number of workers
// can run side by side.
//
// ============================================================================

pub mod config;
pub mod coordinator;
pub mod core;
pub mod key;
pub mod progress;
pub mod record;
pub mod registry;
pub mod runner;
pub mod selector;
pub mod spec;
pub mod storage;
pub mod store;
pub mod transaction;

pub use config::{MigrationConfig, RunnerConfig, TableConfig};
pub use coordinator::BatchCoordinator;
pub use core::{DataType, ErrorKind, MigrationError, Result, Row, Value};
pub use key::{AesGcmKey, Key, KeyError, KeyProvider, KeyVersion, no_key, static_key};
pub use progress::{Progress, ProgressCounter};
pub use record::{ColumnScanner, Record, RecordScanner};
pub use registry::SpecRegistry;
pub use runner::{EncryptionMigrator, MigrationRunner, Migrator, RunSummary, RunnerOptions};
pub use selector::{Direction, MigrationState, UNMIGRATED_KEY_ID};
pub use spec::{TableEncryptionSpec, TableEncryptionSpecBuilder};
pub use storage::InMemoryStorage;
pub use store::{MigrationStore, MigrationTx};

#[cfg(feature = "postgres")]
pub use store::postgres::PgMigrationStore;
