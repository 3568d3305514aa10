use crate::{CandidateKey, Error, RecordChecker, RecordTable, Result, error::bounded};
use async_trait::async_trait;
use core::time::Duration;
use sqlx::{PgPool, postgres::PgPoolOptions};
use std::collections::HashSet;

/// A [`RecordChecker`] that queries PostgreSQL.
///
/// Each check is one statement: the candidate batch is bound as a `text[]`,
/// unnested, and anti-joined against the table's key column.
#[derive(Clone, Debug)]
pub struct PgRecords {
    pool: PgPool,
    timeout: Duration,
}

impl PgRecords {
    /// # Errors
    ///
    /// Returns [`Error::RecordsUnavailable`] if no connection can be
    /// established within `timeout`.
    pub async fn connect(url: &str, max_connections: u32, timeout: Duration) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(timeout)
            .connect(url)
            .await
            .map_err(|e| Error::records(format!("connect: {e}")))?;

        #[cfg(feature = "tracing")]
        tracing::info!(max_connections, "Connected to systems of record");

        Ok(Self::from_pool(pool, timeout))
    }

    pub const fn from_pool(pool: PgPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn absence_query(table: &RecordTable) -> String {
    format!(
        "SELECT c.id FROM UNNEST($1::text[]) AS c(id) \
         LEFT JOIN {table} r ON r.{column}::text = c.id \
         WHERE r.{column} IS NULL",
        table = table.table(),
        column = table.key_column(),
    )
}

#[async_trait]
impl RecordChecker for PgRecords {
    async fn absent_from(
        &self,
        table: &RecordTable,
        candidates: &[CandidateKey],
    ) -> Result<HashSet<CandidateKey>> {
        if candidates.is_empty() {
            return Ok(HashSet::new());
        }

        let sql = absence_query(table);
        let ids: Vec<String> = candidates.iter().map(|key| key.as_str().to_owned()).collect();
        let query = async {
            sqlx::query_scalar::<_, String>(&sql)
                .bind(ids)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| Error::records(format!("{}: {e}", table.table())))
        };
        let absent = bounded(self.timeout, query, || {
            Error::records(format!(
                "{} check timed out after {:?}",
                table.table(),
                self.timeout
            ))
        })
        .await?;

        Ok(absent.into_iter().map(CandidateKey::from).collect())
    }
}
