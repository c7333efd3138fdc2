//! `Task`: one chunk-or-subchunk query execution (spec.md section 4.6).
//!
//! SQL execution itself is a trait boundary (`QueryExecutor`): wrapping a
//! real MySQL connector and generating subchunk-substituted SQL text are
//! both out of scope per spec.md section 1 ("MySQL connector wrapping and
//! SQL-text generation helpers"). `Task::run` only needs a stream of
//! already-encoded row bytes back from whatever executes the SQL.

use crate::channel_shared::ChannelShared;
use crate::sql_conn_mgr::SqlConnMgr;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use qserv_common::error::DispatchError;
use qserv_common::ids::{ChunkId, JobId, QueryId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

/// One pre-encoded result row, opaque to this crate (spec.md section 1).
pub type Row = Vec<u8>;
pub type RowStream = BoxStream<'static, Result<Row, DispatchError>>;

#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Runs `sql` and returns a stream of encoded rows. Waiting for
    /// subchunk-table materialization, if applicable, happens inside this
    /// call (spec.md section 4.6 step 2).
    async fn execute(&self, sql: &str) -> Result<RowStream, DispatchError>;
}

#[derive(Debug, Clone)]
pub struct TaskDescription {
    pub query_id: QueryId,
    pub job_id: JobId,
    pub attempt_count: u32,
    pub chunk_id: ChunkId,
    pub fragment_index: u32,
    pub sql: String,
    pub priority: i32,
    pub interactive: bool,
    pub scan_tables: Vec<String>,
}

pub struct Task {
    pub desc: TaskDescription,
    channel: Weak<dyn ChannelShared>,
    cancelled: AtomicBool,
    booted: AtomicBool,
}

impl Task {
    pub fn new(desc: TaskDescription, channel: &Arc<dyn ChannelShared>) -> Arc<Self> {
        Arc::new(Self {
            desc,
            channel: Arc::downgrade(channel),
            cancelled: AtomicBool::new(false),
            booted: AtomicBool::new(false),
        })
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Removed from its scheduler for running over its time budget (spec.md
    /// section 4.8). Idempotent.
    pub fn boot(&self) -> bool {
        !self.booted.swap(true, Ordering::SeqCst)
    }

    pub fn is_booted(&self) -> bool {
        self.booted.load(Ordering::Acquire)
    }

    /// Runs the execution pipeline (spec.md section 4.6, steps 1-6):
    /// acquire a MySQL connection slot, execute, batch rows into messages no
    /// larger than `desired_limit_bytes`, hand each to the channel, and set
    /// `last=true` on the terminal header.
    pub async fn run(
        self: &Arc<Self>,
        conn_mgr: &SqlConnMgr,
        executor: &dyn QueryExecutor,
        desired_limit_bytes: usize,
    ) -> Result<(), DispatchError> {
        let started = Instant::now();
        let _permit = conn_mgr.acquire().await;
        if self.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }

        let mut rows = executor.execute(&self.desc.sql).await?;
        let mut batch: Vec<Row> = Vec::new();
        let mut batch_bytes = 0usize;
        let mut total_rows: u64 = 0;

        loop {
            if self.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }
            match rows.next().await {
                Some(Ok(row)) => {
                    batch_bytes += row.len();
                    total_rows += 1;
                    batch.push(row);
                    if batch_bytes >= desired_limit_bytes {
                        self.flush(&mut batch, &mut batch_bytes, false).await?;
                    }
                }
                Some(Err(e)) => {
                    self.flush_error(&e).await;
                    return Err(e);
                }
                None => {
                    self.flush(&mut batch, &mut batch_bytes, true).await?;
                    tracing::debug!(
                        query_id = self.desc.query_id,
                        job_id = self.desc.job_id,
                        rows = total_rows,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "task completed"
                    );
                    return Ok(());
                }
            }
        }
    }

    async fn flush(
        self: &Arc<Self>,
        batch: &mut Vec<Row>,
        batch_bytes: &mut usize,
        last: bool,
    ) -> Result<(), DispatchError> {
        if batch.is_empty() && !last {
            return Ok(());
        }
        let channel = self
            .channel
            .upgrade()
            .ok_or_else(|| DispatchError::InvariantViolation("channel dropped before task finished".into()))?;
        let result = qserv_proto::Result {
            query_id: self.desc.query_id as i64,
            job_id: self.desc.job_id,
            attempt_count: self.desc.attempt_count as i32,
            row_count: batch.len() as i32,
            transmit_size: *batch_bytes as i64,
            rows: std::mem::take(batch),
            error_code: 0,
            error_msg: String::new(),
        };
        *batch_bytes = 0;
        channel.transmit(self, result, last).await
    }

    async fn flush_error(self: &Arc<Self>, error: &DispatchError) {
        if let Some(channel) = self.channel.upgrade() {
            let result = qserv_proto::Result {
                query_id: self.desc.query_id as i64,
                job_id: self.desc.job_id,
                attempt_count: self.desc.attempt_count as i32,
                row_count: 0,
                transmit_size: 0,
                rows: vec![],
                error_code: 1,
                error_msg: error.to_string(),
            };
            let _ = channel.transmit(self, result, true).await;
        }
    }
}
