// ============================================================================
// In-Memory Migration Store
// ============================================================================
//
// A process-local database with just enough transactional behavior for the
// migration engine: skip-locked claims, buffered write-back applied on COMMIT,
// and lock release on ROLLBACK or drop.
//
// Lock order is always table -> row locks. Nothing takes a table mutex while
// holding the row lock table.
//
// ============================================================================

use super::{Table, TableSchema};
use crate::core::{MigrationError, Result, Row, Value};
use crate::selector::{ClaimQuery, CountQuery, MigrationState, RowUpdate};
use crate::store::{MigrationStore, MigrationTx};
use crate::transaction::{Change, RowKey, RowLocks, Transaction};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use tracing::trace;

#[derive(Default)]
struct Shared {
    tables: RwLock<HashMap<String, Arc<Mutex<Table>>>>,
    locks: Mutex<RowLocks>,
    write_faults: Mutex<HashSet<RowKey>>,
}

/// Shared handle to an in-memory database. Clones see the same tables.
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for InMemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStorage")
            .field("tables", &self.list_tables())
            .finish()
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_table(&self, schema: TableSchema) -> Result<()> {
        let name = schema.name().to_string();
        let table = Table::new(schema)?;

        let mut tables = self.shared.tables.write()?;
        if tables.contains_key(&name) {
            return Err(MigrationError::Database(format!("Table '{}' already exists", name)));
        }
        tables.insert(name, Arc::new(Mutex::new(table)));
        Ok(())
    }

    pub fn table_exists(&self, name: &str) -> bool {
        self.shared
            .tables
            .read()
            .map(|tables| tables.contains_key(name))
            .unwrap_or(false)
    }

    pub fn list_tables(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .shared
            .tables
            .read()
            .map(|tables| tables.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    fn table(&self, name: &str) -> Result<Arc<Mutex<Table>>> {
        self.shared
            .tables
            .read()?
            .get(name)
            .cloned()
            .ok_or_else(|| MigrationError::Database(format!("Table '{}' does not exist", name)))
    }

    /// Insert outside any migration transaction. Returns the row's id.
    pub fn insert_row(&self, table: &str, row: Row) -> Result<i64> {
        let handle = self.table(table)?;
        let mut table = handle.lock()?;
        table.insert(row)
    }

    /// Plain read. Ignores row locks.
    pub fn get_row(&self, table: &str, id: i64) -> Result<Option<Row>> {
        let handle = self.table(table)?;
        let table = handle.lock()?;
        Ok(table.get(id).cloned())
    }

    /// Application-style update, applied immediately. Returns false when the
    /// row does not exist.
    pub fn update_row(&self, table: &str, id: i64, assignments: &[(String, Value)]) -> Result<bool> {
        let handle = self.table(table)?;
        let mut table = handle.lock()?;
        table.update(id, assignments)
    }

    /// Value of one column of one row, if the row exists.
    pub fn get_value(&self, table: &str, id: i64, column: &str) -> Result<Option<Value>> {
        let handle = self.table(table)?;
        let table = handle.lock()?;
        let idx = table.column_index(column)?;
        Ok(table.get(id).map(|row| row[idx].clone()))
    }

    pub fn row_count(&self, table: &str) -> Result<usize> {
        let handle = self.table(table)?;
        let table = handle.lock()?;
        Ok(table.row_count())
    }

    /// Number of rows of `table` currently locked by open transactions.
    pub fn locked_rows(&self, table: &str) -> Result<usize> {
        Ok(self.shared.locks.lock()?.held_in(table))
    }

    /// Make every later write-back to this row fail.
    pub fn fail_writes_for(&self, table: &str, id: i64) -> Result<()> {
        self.shared.write_faults.lock()?.insert((table.to_string(), id));
        Ok(())
    }

    pub fn clear_write_faults(&self) -> Result<()> {
        self.shared.write_faults.lock()?.clear();
        Ok(())
    }

    /// Apply a committed transaction's changes. Every change is validated
    /// before any row is replaced, so a bad change leaves all tables untouched.
    fn apply(&self, changes: Vec<Change>) -> Result<usize> {
        if changes.is_empty() {
            return Ok(0);
        }

        let mut names: Vec<&str> = changes.iter().map(Change::table_name).collect();
        names.sort_unstable();
        names.dedup();

        let handles = names
            .iter()
            .map(|name| self.table(name))
            .collect::<Result<Vec<_>>>()?;
        let mut guards = Vec::with_capacity(handles.len());
        for handle in &handles {
            guards.push(handle.lock()?);
        }

        let mut staged: BTreeMap<(usize, i64), Row> = BTreeMap::new();
        for change in &changes {
            let Change::UpdateRow { table, id, assignments } = change;
            let slot = names
                .binary_search(&table.as_str())
                .map_err(|_| MigrationError::Database(format!("Table '{}' does not exist", table)))?;

            let base = match staged.get(&(slot, *id)) {
                Some(row) => row.clone(),
                None => match guards[slot].get(*id) {
                    Some(row) => row.clone(),
                    None => continue,
                },
            };
            let row = guards[slot].assign(&base, assignments)?;
            staged.insert((slot, *id), row);
        }

        let applied = staged.len();
        for ((slot, id), row) in staged {
            guards[slot].replace(id, row);
        }
        Ok(applied)
    }
}

/// Non-text key-ids can only come from a misconfigured table; they count as
/// migrated so that decryption surfaces them instead of skipping them.
fn in_state(key_id: &Value, state: MigrationState) -> bool {
    match key_id {
        Value::Null => state.matches(None),
        Value::Text(s) => state.matches(Some(s.as_str())),
        _ => state == MigrationState::Migrated,
    }
}

#[async_trait]
impl MigrationStore for InMemoryStorage {
    async fn begin(&self) -> Result<Box<dyn MigrationTx>> {
        let txn = Transaction::new();
        trace!(txn = %txn.id(), "begin");
        Ok(Box::new(MemoryTransaction {
            storage: self.clone(),
            txn,
        }))
    }

    async fn count(&self, query: &CountQuery) -> Result<u64> {
        let handle = self.table(&query.table)?;
        let table = handle.lock()?;
        let idx = table.column_index(&query.key_id_column)?;
        let count = table
            .scan()
            .filter(|(_, row)| in_state(&row[idx], query.state))
            .count();
        Ok(count as u64)
    }
}

pub struct MemoryTransaction {
    storage: InMemoryStorage,
    txn: Transaction,
}

impl MemoryTransaction {
    fn release(&self) {
        let mut locks = self
            .storage
            .shared
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.release_all(self.txn.id(), self.txn.claimed());
    }
}

#[async_trait]
impl MigrationTx for MemoryTransaction {
    async fn claim_batch(&mut self, query: &ClaimQuery) -> Result<Vec<Row>> {
        let handle = self.storage.table(&query.table)?;
        let table = handle.lock()?;
        let indices = query
            .columns()
            .into_iter()
            .map(|column| table.column_index(column))
            .collect::<Result<Vec<_>>>()?;
        let key_idx = indices[1];

        let txn_id = self.txn.id();
        let mut locks = self.storage.shared.locks.lock()?;
        let mut claimed = Vec::new();

        for (id, row) in table.scan() {
            if claimed.len() >= query.limit {
                break;
            }
            if !in_state(&row[key_idx], query.state) {
                continue;
            }
            if !locks.try_lock(&query.table, id, txn_id) {
                continue;
            }
            self.txn.record_claim((query.table.clone(), id))?;
            claimed.push(indices.iter().map(|&i| row[i].clone()).collect());
        }

        trace!(txn = %txn_id, table = %query.table, rows = claimed.len(), "claimed");
        Ok(claimed)
    }

    async fn write_back(&mut self, update: &RowUpdate) -> Result<()> {
        let key = (update.table.clone(), update.id);
        if self.storage.shared.write_faults.lock()?.contains(&key) {
            return Err(MigrationError::Database(format!(
                "write to {} row {} failed",
                update.table, update.id
            )));
        }

        let mut assignments = update.assignments.clone();
        assignments.push((update.key_id_column.clone(), Value::Text(update.key_id.clone())));

        {
            let handle = self.storage.table(&update.table)?;
            let table = handle.lock()?;
            table.apply_assignments(update.id, &assignments)?;
        }

        self.txn.record_change(Change::UpdateRow {
            table: update.table.clone(),
            id: update.id,
            assignments,
        })
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        let changes = self.txn.commit()?;
        let result = self.storage.apply(changes);
        self.release();
        let applied = result?;
        trace!(txn = %self.txn.id(), rows = applied, "commit");
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        self.txn.rollback()?;
        self.release();
        trace!(txn = %self.txn.id(), "rollback");
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if self.txn.state().is_active() {
            let _ = self.txn.rollback();
            self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Column, DataType};
    use crate::selector::UNMIGRATED_KEY_ID;

    fn storage() -> InMemoryStorage {
        let storage = InMemoryStorage::new();
        storage
            .create_table(TableSchema::new(
                "secrets",
                vec![
                    Column::new("id", DataType::Integer).not_null(),
                    Column::new("encryption_key_id", DataType::Text),
                    Column::new("value", DataType::Text),
                ],
            ))
            .unwrap();
        for id in 1..=4 {
            storage
                .insert_row(
                    "secrets",
                    vec![Value::Integer(id), Value::Null, Value::Text(format!("v{}", id))],
                )
                .unwrap();
        }
        storage
    }

    fn claim(limit: usize) -> ClaimQuery {
        ClaimQuery {
            table: "secrets".into(),
            id_column: "id".into(),
            key_id_column: "encryption_key_id".into(),
            value_columns: vec!["value".into()],
            value_type: DataType::Text,
            state: MigrationState::Unmigrated,
            limit,
        }
    }

    fn update(id: i64, value: &str) -> RowUpdate {
        RowUpdate {
            table: "secrets".into(),
            id_column: "id".into(),
            id,
            value_type: DataType::Text,
            assignments: vec![("value".into(), Value::Text(value.into()))],
            key_id_column: "encryption_key_id".into(),
            key_id: "k1".into(),
        }
    }

    fn count(state: MigrationState) -> CountQuery {
        CountQuery {
            table: "secrets".into(),
            key_id_column: "encryption_key_id".into(),
            state,
        }
    }

    #[tokio::test]
    async fn test_claims_skip_locked_rows() {
        let storage = storage();

        let mut a = storage.begin().await.unwrap();
        let rows = a.claim_batch(&claim(3)).await.unwrap();
        let ids: Vec<i64> = rows.iter().map(|r| r[0].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        let mut b = storage.begin().await.unwrap();
        let rows = b.claim_batch(&claim(3)).await.unwrap();
        let ids: Vec<i64> = rows.iter().map(|r| r[0].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![4]);
        assert_eq!(storage.locked_rows("secrets").unwrap(), 4);

        a.rollback().await.unwrap();
        b.rollback().await.unwrap();
        assert_eq!(storage.locked_rows("secrets").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_commit_applies_buffered_writes() {
        let storage = storage();

        let mut tx = storage.begin().await.unwrap();
        tx.claim_batch(&claim(1)).await.unwrap();
        tx.write_back(&update(1, "sealed")).await.unwrap();

        // Not visible before commit
        assert_eq!(
            storage.get_value("secrets", 1, "value").unwrap(),
            Some(Value::Text("v1".into()))
        );

        tx.commit().await.unwrap();
        assert_eq!(
            storage.get_value("secrets", 1, "value").unwrap(),
            Some(Value::Text("sealed".into()))
        );
        assert_eq!(storage.count(&count(MigrationState::Migrated)).await.unwrap(), 1);
        assert_eq!(storage.count(&count(MigrationState::Unmigrated)).await.unwrap(), 3);
        assert_eq!(storage.locked_rows("secrets").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_drop_rolls_back() {
        let storage = storage();
        {
            let mut tx = storage.begin().await.unwrap();
            tx.claim_batch(&claim(2)).await.unwrap();
            tx.write_back(&update(1, "sealed")).await.unwrap();
            assert_eq!(storage.locked_rows("secrets").unwrap(), 2);
        }
        assert_eq!(storage.locked_rows("secrets").unwrap(), 0);
        assert_eq!(
            storage.get_value("secrets", 1, "encryption_key_id").unwrap(),
            Some(Value::Null)
        );
    }

    #[tokio::test]
    async fn test_injected_write_failure() {
        let storage = storage();
        storage.fail_writes_for("secrets", 2).unwrap();

        let mut tx = storage.begin().await.unwrap();
        tx.claim_batch(&claim(2)).await.unwrap();
        tx.write_back(&update(1, "sealed")).await.unwrap();
        assert!(tx.write_back(&update(2, "sealed")).await.is_err());
        tx.rollback().await.unwrap();

        assert_eq!(storage.count(&count(MigrationState::Unmigrated)).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_sentinel_and_null_are_both_unmigrated() {
        let storage = storage();
        storage
            .update_row(
                "secrets",
                1,
                &[("encryption_key_id".into(), Value::Text(UNMIGRATED_KEY_ID.into()))],
            )
            .unwrap();
        storage
            .update_row("secrets", 2, &[("encryption_key_id".into(), Value::Text("k".into()))])
            .unwrap();

        assert_eq!(storage.count(&count(MigrationState::Unmigrated)).await.unwrap(), 3);
        assert_eq!(storage.count(&count(MigrationState::Migrated)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_readers_ignore_row_locks() {
        let storage = storage();
        let mut tx = storage.begin().await.unwrap();
        tx.claim_batch(&claim(4)).await.unwrap();

        assert!(storage.get_row("secrets", 3).unwrap().is_some());
        assert_eq!(storage.count(&count(MigrationState::Unmigrated)).await.unwrap(), 4);
        tx.rollback().await.unwrap();
    }

    #[test]
    fn test_duplicate_table() {
        let storage = storage();
        assert!(storage
            .create_table(TableSchema::new(
                "secrets",
                vec![Column::new("id", DataType::Integer)]
            ))
            .is_err());
        assert_eq!(storage.list_tables(), vec!["secrets".to_string()]);
        assert!(storage.table_exists("secrets"));
    }
}
