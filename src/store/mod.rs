//! Database seam of the engine.
//!
//! The engine only needs three things from a database: a transaction that can
//! claim a bounded set of rows while skipping rows claimed by other
//! transactions, a keyed write-back inside that transaction, and an unlocked
//! count. Any backend with a skip-locked primitive can provide them.

#[cfg(feature = "postgres")]
pub mod postgres;

use crate::core::{Result, Row};
use crate::selector::{ClaimQuery, CountQuery, RowUpdate};
use async_trait::async_trait;

#[async_trait]
pub trait MigrationStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn MigrationTx>>;

    async fn count(&self, query: &CountQuery) -> Result<u64>;
}

/// An open transaction. Dropping it without calling [`commit`](Self::commit)
/// must roll it back and release every claimed row.
#[async_trait]
pub trait MigrationTx: Send {
    /// Lock and return up to `query.limit` rows in `query.state`, ordered by
    /// id. Rows locked by another transaction are skipped, never waited on.
    async fn claim_batch(&mut self, query: &ClaimQuery) -> Result<Vec<Row>>;

    async fn write_back(&mut self, update: &RowUpdate) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}
