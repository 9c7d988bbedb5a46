//! Point-in-time migration progress of a table.

use crate::core::Result;
use crate::selector::{CountQuery, Direction, MigrationState};
use crate::spec::TableEncryptionSpec;
use crate::store::MigrationStore;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub encrypted: u64,
    pub unencrypted: u64,
}

impl Progress {
    pub fn total(&self) -> u64 {
        self.encrypted + self.unencrypted
    }

    /// Share of rows already in the target state of `direction`, in `[0, 1]`.
    /// An empty table is complete.
    pub fn fraction(&self, direction: Direction) -> f64 {
        let total = self.total();
        if total == 0 {
            return 1.0;
        }
        let done = match direction {
            Direction::ToEncrypt => self.encrypted,
            Direction::ToDecrypt => self.unencrypted,
        };
        done as f64 / total as f64
    }

    pub fn is_complete(&self, direction: Direction) -> bool {
        self.remaining(direction) == 0
    }

    /// Rows still in the source state of `direction`.
    pub fn remaining(&self, direction: Direction) -> u64 {
        match direction {
            Direction::ToEncrypt => self.unencrypted,
            Direction::ToDecrypt => self.encrypted,
        }
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} encrypted, {} unencrypted ({:.1}%)",
            self.encrypted,
            self.unencrypted,
            self.fraction(Direction::ToEncrypt) * 100.0
        )
    }
}

/// Counts rows per migration state with the same predicate batches claim by.
/// Takes no row locks.
#[derive(Clone)]
pub struct ProgressCounter {
    store: Arc<dyn MigrationStore>,
}

impl ProgressCounter {
    pub fn new(store: Arc<dyn MigrationStore>) -> Self {
        Self { store }
    }

    pub async fn count(&self, spec: &TableEncryptionSpec) -> Result<Progress> {
        let encrypted = self
            .store
            .count(&CountQuery::new(spec, MigrationState::Migrated))
            .await?;
        let unencrypted = self
            .store
            .count(&CountQuery::new(spec, MigrationState::Unmigrated))
            .await?;

        Ok(Progress {
            encrypted,
            unencrypted,
        })
    }
}
