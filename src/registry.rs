//! The set of encryptable tables known to a process.
//!
//! Adding a table means registering one more spec; nothing else changes.

use crate::core::{MigrationError, Result};
use crate::key::KeyProvider;
use crate::spec::TableEncryptionSpec;
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct SpecRegistry {
    specs: Vec<TableEncryptionSpec>,
    by_table: HashMap<String, usize>,
}

impl SpecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and add a spec. Table names must be unique.
    pub fn register(&mut self, spec: TableEncryptionSpec) -> Result<()> {
        spec.validate()?;
        if self.by_table.contains_key(spec.table()) {
            return Err(MigrationError::DuplicateTable(spec.table().to_string()));
        }
        self.by_table.insert(spec.table().to_string(), self.specs.len());
        self.specs.push(spec);
        Ok(())
    }

    pub fn get(&self, table: &str) -> Result<&TableEncryptionSpec> {
        self.by_table
            .get(table)
            .map(|&idx| &self.specs[idx])
            .ok_or_else(|| MigrationError::UnknownTable(table.to_string()))
    }

    pub fn contains(&self, table: &str) -> bool {
        self.by_table.contains_key(table)
    }

    /// Specs in registration order
    pub fn iter(&self) -> impl Iterator<Item = &TableEncryptionSpec> {
        self.specs.iter()
    }

    pub fn tables(&self) -> Vec<&str> {
        self.specs.iter().map(TableEncryptionSpec::table).collect()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Rebind every spec to `provider`.
    pub fn with_key_provider(&self, provider: KeyProvider) -> Self {
        Self {
            specs: self
                .specs
                .iter()
                .map(|spec| spec.with_key_provider(provider.clone()))
                .collect(),
            by_table: self.by_table.clone(),
        }
    }
}

impl<'a> IntoIterator for &'a SpecRegistry {
    type Item = &'a TableEncryptionSpec;
    type IntoIter = std::slice::Iter<'a, TableEncryptionSpec>;

    fn into_iter(self) -> Self::IntoIter {
        self.specs.iter()
    }
}
