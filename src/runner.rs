// ============================================================================
// Migration Runner
// ============================================================================
//
// Drives batches until a table is drained. Every batch is independent: the
// runner holds no state between batches other than the running totals, and
// concurrent workers coordinate only through row locks in the store.
//
// ============================================================================

use crate::coordinator::BatchCoordinator;
use crate::core::{MigrationError, Result};
use crate::progress::{Progress, ProgressCounter};
use crate::registry::SpecRegistry;
use crate::selector::Direction;
use crate::spec::TableEncryptionSpec;
use crate::store::MigrationStore;
use async_trait::async_trait;
use futures::future::try_join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunnerOptions {
    /// Pause between two batches of the same worker.
    pub batch_delay: Duration,
    /// Deadline for a single batch. An expired batch is rolled back.
    pub batch_timeout: Option<Duration>,
    /// Stop a worker after this many non-empty batches.
    pub max_batches: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub batches: usize,
    pub rows: usize,
}

impl RunSummary {
    pub fn merge(&mut self, other: RunSummary) {
        self.batches += other.batches;
        self.rows += other.rows;
    }
}

#[derive(Clone)]
pub struct MigrationRunner {
    coordinator: BatchCoordinator,
    counter: ProgressCounter,
    options: RunnerOptions,
}

impl MigrationRunner {
    pub fn new(store: Arc<dyn MigrationStore>) -> Self {
        Self {
            coordinator: BatchCoordinator::new(store.clone()),
            counter: ProgressCounter::new(store),
            options: RunnerOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RunnerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn coordinator(&self) -> &BatchCoordinator {
        &self.coordinator
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.options
    }

    pub async fn progress(&self, spec: &TableEncryptionSpec) -> Result<Progress> {
        self.counter.count(spec).await
    }

    /// One batch, bounded by the batch timeout. On timeout the in-flight
    /// transaction is dropped, which rolls it back.
    pub async fn run_batch(&self, spec: &TableEncryptionSpec, direction: Direction) -> Result<usize> {
        let batch = self.coordinator.run_batch(spec, direction);
        match self.options.batch_timeout {
            Some(after) => tokio::time::timeout(after, batch)
                .await
                .map_err(|_| MigrationError::Timeout {
                    table: spec.table().to_string(),
                    after,
                })?,
            None => batch.await,
        }
    }

    /// Run batches until one processes no rows.
    pub async fn run(&self, spec: &TableEncryptionSpec, direction: Direction) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        loop {
            if self.options.max_batches.is_some_and(|max| summary.batches >= max) {
                debug!(table = %spec.table(), %direction, "batch limit reached");
                break;
            }

            let rows = self.run_batch(spec, direction).await?;
            if rows == 0 {
                break;
            }
            summary.batches += 1;
            summary.rows += rows;

            if !self.options.batch_delay.is_zero() {
                tokio::time::sleep(self.options.batch_delay).await;
            }
        }

        info!(
            table = %spec.table(),
            %direction,
            batches = summary.batches,
            rows = summary.rows,
            "run finished"
        );
        Ok(summary)
    }

    /// `workers` concurrent [`run`](Self::run) loops over the same table.
    pub async fn run_workers(
        &self,
        spec: &TableEncryptionSpec,
        direction: Direction,
        workers: usize,
    ) -> Result<RunSummary> {
        let loops = (0..workers.max(1)).map(|_| self.run(spec, direction));
        let results = try_join_all(loops).await?;

        let mut summary = RunSummary::default();
        for result in results {
            summary.merge(result);
        }
        Ok(summary)
    }

    /// Drain every registered table, one table at a time.
    pub async fn run_all(
        &self,
        registry: &SpecRegistry,
        direction: Direction,
        workers: usize,
    ) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        for spec in registry {
            summary.merge(self.run_workers(spec, direction, workers).await?);
        }
        Ok(summary)
    }
}

/// Step-wise migration driven by an external scheduler: each `up`/`down`
/// call advances every table by at most one batch.
#[async_trait]
pub trait Migrator: Send + Sync {
    /// Completion in `[0, 1]`; `reverse` asks about decryption.
    async fn progress(&self, reverse: bool) -> Result<f64>;

    async fn up(&self) -> Result<()>;

    async fn down(&self) -> Result<()>;
}

pub struct EncryptionMigrator {
    runner: MigrationRunner,
    registry: Arc<SpecRegistry>,
}

impl EncryptionMigrator {
    pub fn new(runner: MigrationRunner, registry: Arc<SpecRegistry>) -> Self {
        Self { runner, registry }
    }

    async fn step(&self, direction: Direction) -> Result<()> {
        for spec in self.registry.iter() {
            self.runner.run_batch(spec, direction).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Migrator for EncryptionMigrator {
    async fn progress(&self, reverse: bool) -> Result<f64> {
        let direction = if reverse {
            Direction::ToDecrypt
        } else {
            Direction::ToEncrypt
        };

        let mut fraction: f64 = 1.0;
        for spec in self.registry.iter() {
            let progress = self.runner.progress(spec).await?;
            fraction = fraction.min(progress.fraction(direction));
        }
        Ok(fraction)
    }

    async fn up(&self) -> Result<()> {
        self.step(Direction::ToEncrypt).await
    }

    async fn down(&self) -> Result<()> {
        self.step(Direction::ToDecrypt).await
    }
}
