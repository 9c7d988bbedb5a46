//! Postgres backend. Claims use `FOR UPDATE SKIP LOCKED`, so any number of
//! workers, in any number of processes, can share one table.

use super::{MigrationStore, MigrationTx};
use crate::core::{DataType, MigrationError, Result, Row, Value};
use crate::selector::{ClaimQuery, CountQuery, RowUpdate, UNMIGRATED_KEY_ID};
use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row as _};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct PgMigrationStore {
    pool: PgPool,
}

impl PgMigrationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        debug!(max_connections, "connecting to postgres");
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl MigrationStore for PgMigrationStore {
    async fn begin(&self) -> Result<Box<dyn MigrationTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgMigrationTx { tx }))
    }

    async fn count(&self, query: &CountQuery) -> Result<u64> {
        let sql = query.to_sql();
        let count = sqlx::query_scalar::<_, i64>(&sql)
            .bind(UNMIGRATED_KEY_ID)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

/// Rolled back by sqlx when dropped uncommitted.
pub struct PgMigrationTx {
    tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl MigrationTx for PgMigrationTx {
    async fn claim_batch(&mut self, query: &ClaimQuery) -> Result<Vec<Row>> {
        let sql = query.to_sql();
        let rows = sqlx::query(&sql)
            .bind(UNMIGRATED_KEY_ID)
            .fetch_all(&mut *self.tx)
            .await?;

        rows.iter().map(|row| decode_row(row, query)).collect()
    }

    async fn write_back(&mut self, update: &RowUpdate) -> Result<()> {
        let sql = update.to_sql();
        let mut stmt = sqlx::query(&sql);
        for (_, value) in &update.assignments {
            stmt = match value {
                Value::Null if update.value_type == DataType::Bytes => stmt.bind(None::<Vec<u8>>),
                Value::Null => stmt.bind(None::<String>),
                Value::Integer(i) => stmt.bind(*i),
                Value::Text(s) => stmt.bind(s.clone()),
                Value::Bytes(b) => stmt.bind(b.clone()),
            };
        }

        let result = stmt
            .bind(update.key_id.clone())
            .bind(update.id)
            .execute(&mut *self.tx)
            .await?;

        if result.rows_affected() != 1 {
            return Err(MigrationError::Database(format!(
                "expected to update 1 row of {} (id {}), updated {}",
                update.table,
                update.id,
                result.rows_affected()
            )));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let Self { tx } = *self;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let Self { tx } = *self;
        tx.rollback().await?;
        Ok(())
    }
}

/// A column the driver cannot read is malformed row data, not a server fault.
fn column_error(table: &str) -> impl Fn(sqlx::Error) -> MigrationError + '_ {
    move |err| match err {
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnIndexOutOfBounds { .. }
        | sqlx::Error::Decode(_) => MigrationError::decode(table, err.to_string()),
        other => MigrationError::from(other),
    }
}

fn decode_row(row: &PgRow, query: &ClaimQuery) -> Result<Row> {
    let malformed = column_error(&query.table);

    let id = match row.try_get::<i64, _>(0) {
        Ok(id) => id,
        Err(_) => i64::from(row.try_get::<i32, _>(0).map_err(&malformed)?),
    };

    let key_id: Option<String> = row.try_get(1).map_err(&malformed)?;

    let mut out = Vec::with_capacity(query.value_columns.len() + 2);
    out.push(Value::Integer(id));
    out.push(Value::from(key_id));

    for idx in 2..query.value_columns.len() + 2 {
        let value = match query.value_type {
            DataType::Bytes => {
                Value::from(row.try_get::<Option<Vec<u8>>, _>(idx).map_err(&malformed)?)
            }
            _ => Value::from(row.try_get::<Option<String>, _>(idx).map_err(&malformed)?),
        };
        out.push(value);
    }
    Ok(out)
}
