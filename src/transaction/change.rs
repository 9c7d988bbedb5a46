// ============================================================================
// Transaction Change Tracking
// ============================================================================
//
// A Change is recorded while the transaction runs and applied only on COMMIT.
// ROLLBACK discards the list.
//
// ============================================================================

use crate::core::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// Overwrite some columns of the row with primary key `id`
    UpdateRow {
        table: String,
        id: i64,
        assignments: Vec<(String, Value)>,
    },
}

impl Change {
    pub fn table_name(&self) -> &str {
        match self {
            Change::UpdateRow { table, .. } => table,
        }
    }

    pub fn row_id(&self) -> i64 {
        match self {
            Change::UpdateRow { id, .. } => *id,
        }
    }
}
