//! [`MergeSink`]: the storage backend an [`InfileMerger`](super::InfileMerger)
//! writes into. Production code talks to MySQL through `sqlx`; tests use
//! [`InMemoryMergeSink`] so the merge/scrub/finalize logic can be exercised
//! without a live server.

use async_trait::async_trait;
use qserv_common::error::DispatchError;
use std::sync::Arc;

#[async_trait]
pub trait MergeSink: Send + Sync {
    /// Appends `rows` tagged with `job_id_attempt`, returning the number of
    /// bytes written (used for the merge-table byte cap).
    async fn insert_rows(&self, job_id_attempt: i64, rows: &[Vec<u8>]) -> Result<u64, DispatchError>;

    /// Deletes every row previously inserted under any of `job_id_attempts`.
    async fn delete_attempts(&self, job_id_attempts: &[i64]) -> Result<(), DispatchError>;

    /// Runs the final aggregation/copy step and returns `(bytes, rows)`.
    async fn finalize(&self) -> Result<(u64, u64), DispatchError>;
}

/// In-memory stand-in for the MySQL merge table, keyed by `job_id_attempt`.
/// Mirrors the shape of a real merge table closely enough (one row group per
/// attempt, deletable by key) to exercise the scrub/finalize invariants.
pub struct InMemoryMergeSink {
    rows: parking_lot::Mutex<std::collections::HashMap<i64, Vec<Vec<u8>>>>,
}

impl InMemoryMergeSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rows: parking_lot::Mutex::new(std::collections::HashMap::new()),
        })
    }

    pub fn total_rows(&self) -> usize {
        self.rows.lock().values().map(|v| v.len()).sum()
    }
}

#[async_trait]
impl MergeSink for InMemoryMergeSink {
    async fn insert_rows(&self, job_id_attempt: i64, rows: &[Vec<u8>]) -> Result<u64, DispatchError> {
        let bytes = rows.iter().map(|r| r.len() as u64).sum();
        self.rows
            .lock()
            .entry(job_id_attempt)
            .or_default()
            .extend_from_slice(rows);
        Ok(bytes)
    }

    async fn delete_attempts(&self, job_id_attempts: &[i64]) -> Result<(), DispatchError> {
        let mut rows = self.rows.lock();
        for jia in job_id_attempts {
            rows.remove(jia);
        }
        Ok(())
    }

    async fn finalize(&self) -> Result<(u64, u64), DispatchError> {
        let rows = self.rows.lock();
        let row_count: u64 = rows.values().map(|v| v.len() as u64).sum();
        let byte_count: u64 = rows.values().flatten().map(|r| r.len() as u64).sum();
        Ok((byte_count, row_count))
    }
}

/// Production sink backed by a real merge table over a MySQL pool. The
/// result table is created up front with a `jobIdAttempt BIGINT` column
/// (spec.md section 4.7) plus whatever schema the query-analysis layer
/// derived; that schema is this crate's boundary, so `create_table_sql` is
/// supplied by the caller rather than derived here.
pub struct MySqlMergeSink {
    pool: sqlx::MySqlPool,
    table: String,
}

impl MySqlMergeSink {
    pub async fn create(
        pool: sqlx::MySqlPool,
        table: String,
        create_table_sql: &str,
    ) -> Result<Arc<Self>, DispatchError> {
        sqlx::query(create_table_sql)
            .execute(&pool)
            .await
            .map_err(|e| DispatchError::MergeSql(e.to_string()))?;
        Ok(Arc::new(Self { pool, table }))
    }
}

#[async_trait]
impl MergeSink for MySqlMergeSink {
    async fn insert_rows(&self, job_id_attempt: i64, rows: &[Vec<u8>]) -> Result<u64, DispatchError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut bytes = 0u64;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DispatchError::MergeSql(e.to_string()))?;
        for row in rows {
            bytes += row.len() as u64;
            sqlx::query(&format!(
                "INSERT INTO {} (jobIdAttempt, rowData) VALUES (?, ?)",
                self.table
            ))
            .bind(job_id_attempt)
            .bind(row.as_slice())
            .execute(&mut *tx)
            .await
            .map_err(|e| DispatchError::MergeSql(e.to_string()))?;
        }
        tx.commit().await.map_err(|e| DispatchError::MergeSql(e.to_string()))?;
        Ok(bytes)
    }

    async fn delete_attempts(&self, job_id_attempts: &[i64]) -> Result<(), DispatchError> {
        if job_id_attempts.is_empty() {
            return Ok(());
        }
        let placeholders = job_id_attempts.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!("DELETE FROM {} WHERE jobIdAttempt IN ({})", self.table, placeholders);
        let mut query = sqlx::query(&sql);
        for jia in job_id_attempts {
            query = query.bind(jia);
        }
        query
            .execute(&self.pool)
            .await
            .map_err(|e| DispatchError::MergeSql(e.to_string()))?;
        Ok(())
    }

    async fn finalize(&self) -> Result<(u64, u64), DispatchError> {
        let row: (i64, Option<i64>) = sqlx::query_as(&format!(
            "SELECT COUNT(*), SUM(LENGTH(rowData)) FROM {}",
            self.table
        ))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DispatchError::MergeSql(e.to_string()))?;
        Ok((row.1.unwrap_or(0) as u64, row.0 as u64))
    }
}
