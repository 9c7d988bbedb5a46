use super::TransactionId;
use std::collections::HashMap;

/// (table, primary key)
pub type RowKey = (String, i64);

/// Exclusive row locks, one holder per row.
///
/// Plain readers never consult this table; only claims do.
#[derive(Debug, Default)]
pub struct RowLocks {
    holders: HashMap<RowKey, TransactionId>,
}

impl RowLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn holder(&self, table: &str, id: i64) -> Option<TransactionId> {
        self.holders.get(&(table.to_string(), id)).copied()
    }

    /// Lock the row for `txn`. Returns false, without waiting, when another
    /// transaction holds it.
    pub fn try_lock(&mut self, table: &str, id: i64, txn: TransactionId) -> bool {
        let holder = self.holders.entry((table.to_string(), id)).or_insert(txn);
        *holder == txn
    }

    pub fn release_all(&mut self, txn: TransactionId, keys: &[RowKey]) {
        for key in keys {
            if self.holders.get(key) == Some(&txn) {
                self.holders.remove(key);
            }
        }
    }

    pub fn held_in(&self, table: &str) -> usize {
        self.holders.keys().filter(|(t, _)| t == table).count()
    }
}
