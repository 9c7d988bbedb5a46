// ============================================================================
// Transaction Management Module
// ============================================================================
//
// Transactions for the in-memory store. Writes are buffered as changes and
// applied at commit; row locks are held until commit or rollback.
//
// ============================================================================

pub mod change;
pub mod locks;
pub mod state;

pub use change::Change;
pub use locks::{RowKey, RowLocks};
pub use state::{Transaction, TransactionId, TransactionState};
