use crate::core::{Column, DataType, MigrationError, Result, Row, Schema, Value};
use std::collections::BTreeMap;

/// A table keyed by an INTEGER primary key, kept in key order.
#[derive(Debug, Clone)]
pub struct Table {
    schema: TableSchema,
    rows: BTreeMap<i64, Row>,
    pk_index: usize,
}

impl Table {
    pub fn new(schema: TableSchema) -> Result<Self> {
        let pk_index = schema
            .schema()
            .find_column_index(schema.primary_key())
            .ok_or_else(|| column_not_found(schema.primary_key(), schema.name()))?;

        let pk = &schema.schema().columns()[pk_index];
        if pk.data_type != DataType::Integer {
            return Err(MigrationError::Database(format!(
                "Primary key '{}' of table '{}' must be INTEGER",
                pk.name,
                schema.name()
            )));
        }

        Ok(Self {
            schema,
            rows: BTreeMap::new(),
            pk_index,
        })
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn name(&self) -> &str {
        self.schema.name()
    }

    pub fn insert(&mut self, row: Row) -> Result<i64> {
        self.validate_row(&row)?;

        let id = row[self.pk_index]
            .as_i64()
            .ok_or_else(|| MigrationError::Database(format!("Primary key of '{}' cannot be NULL", self.name())))?;

        if self.rows.contains_key(&id) {
            return Err(MigrationError::Database(format!(
                "Unique constraint violation: '{}' already contains {} = {}",
                self.name(),
                self.schema.primary_key(),
                id
            )));
        }

        self.rows.insert(id, row);
        Ok(id)
    }

    pub fn get(&self, id: i64) -> Option<&Row> {
        self.rows.get(&id)
    }

    /// Compute the row that `assignments` would produce without storing it.
    pub fn apply_assignments(&self, id: i64, assignments: &[(String, Value)]) -> Result<Option<Row>> {
        match self.rows.get(&id) {
            Some(current) => self.assign(current, assignments).map(Some),
            None => Ok(None),
        }
    }

    /// Validate `assignments` against the schema and apply them to a copy of `base`.
    pub fn assign(&self, base: &Row, assignments: &[(String, Value)]) -> Result<Row> {
        let mut row = base.clone();
        for (column, value) in assignments {
            let idx = self.column_index(column)?;
            if idx == self.pk_index {
                return Err(MigrationError::Database(format!(
                    "Cannot update primary key of '{}'",
                    self.name()
                )));
            }
            self.schema.schema().columns()[idx].validate(value)?;
            row[idx] = value.clone();
        }
        Ok(row)
    }

    /// Update columns of an existing row. Returns false when the row is absent.
    pub fn update(&mut self, id: i64, assignments: &[(String, Value)]) -> Result<bool> {
        match self.apply_assignments(id, assignments)? {
            Some(row) => {
                self.rows.insert(id, row);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Overwrite a row with one previously produced by [`apply_assignments`](Self::apply_assignments).
    pub(crate) fn replace(&mut self, id: i64, row: Row) {
        self.rows.insert(id, row);
    }

    /// Rows in ascending primary key order
    pub fn scan(&self) -> impl Iterator<Item = (i64, &Row)> {
        self.rows.iter().map(|(id, row)| (*id, row))
    }

    pub fn column_index(&self, column: &str) -> Result<usize> {
        self.schema
            .schema()
            .find_column_index(column)
            .ok_or_else(|| column_not_found(column, self.name()))
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    fn validate_row(&self, row: &Row) -> Result<()> {
        let columns = self.schema.schema().columns();
        if row.len() != columns.len() {
            return Err(MigrationError::Database(format!(
                "Expected {} columns, got {}",
                columns.len(),
                row.len()
            )));
        }
        for (column, value) in columns.iter().zip(row.iter()) {
            column.validate(value)?;
        }
        Ok(())
    }
}

fn column_not_found(column: &str, table: &str) -> MigrationError {
    MigrationError::Database(format!("Column '{}' not found in table '{}'", column, table))
}

#[derive(Debug, Clone)]
pub struct TableSchema {
    name: String,
    schema: Schema,
    primary_key: String,
}

impl TableSchema {
    /// The first column is the primary key unless [`primary_key`](Self::primary_key) says otherwise.
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> Self {
        let primary_key = columns.first().map(|c| c.name.clone()).unwrap_or_default();
        Self {
            name: name.into(),
            schema: Schema::new(columns),
            primary_key,
        }
    }

    pub fn with_primary_key(mut self, column: impl Into<String>) -> Self {
        self.primary_key = column.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }
}
