//! `InfileMerger`: the czar-side result assembly sink (spec.md section
//! 4.7). Ingests framed result messages from many concurrent
//! `QueryRequest`s into a single "merge table", tagging every row with
//! `jobIdAttempt` so rows from a superseded attempt can be scrubbed before
//! finalization.
//!
//! Actually writing SQL against a MySQL connection is delegated to a
//! [`MergeSink`] so this module stays storage-engine-agnostic (spec.md
//! section 4.7: "the engine choice does not affect the rest of the
//! design") and so tests can run against an in-memory sink instead of a
//! real MySQL server.

use qserv_common::error::DispatchError;
use qserv_common::ids::job_id_attempt;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};

pub mod sink;
pub use sink::{InMemoryMergeSink, MergeSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged { rows: u64 },
    /// Discarded because the attempt was scrubbed or the query is already
    /// limit-row-complete/failed — a deliberate no-op, not an error.
    Skipped,
}

#[derive(Debug, Default)]
struct ScrubGate {
    /// Set while a `prepScrub` DELETE is pending or running; new merges
    /// must wait for it to clear (spec.md section 4.7,
    /// "holdMergingForRowDelete").
    holding: bool,
    concurrent_merges: i64,
}

pub struct InfileMergerConfig {
    pub max_job_attempts: u32,
    pub max_merged_bytes: u64,
    pub max_connections: usize,
}

/// Czar-side result assembly sink for one `UserQuery`.
pub struct InfileMerger {
    sink: Arc<dyn MergeSink>,
    config: InfileMergerConfig,
    conn_budget: Arc<Semaphore>,
    gate: parking_lot::Mutex<ScrubGate>,
    gate_changed: Notify,
    invalid_attempts: parking_lot::Mutex<HashSet<i64>>,
    merged_bytes: AtomicU64,
    merged_rows: AtomicI64,
    failed: AtomicBool,
}

impl InfileMerger {
    pub fn new(sink: Arc<dyn MergeSink>, config: InfileMergerConfig) -> Arc<Self> {
        Arc::new(Self {
            conn_budget: Arc::new(Semaphore::new(config.max_connections.max(1))),
            sink,
            config,
            gate: parking_lot::Mutex::new(ScrubGate::default()),
            gate_changed: Notify::new(),
            invalid_attempts: parking_lot::Mutex::new(HashSet::new()),
            merged_bytes: AtomicU64::new(0),
            merged_rows: AtomicI64::new(0),
            failed: AtomicBool::new(false),
        })
    }

    fn job_id_attempt(&self, job_id: i32, attempt: u32) -> i64 {
        job_id_attempt(job_id, attempt, self.config.max_job_attempts)
    }

    /// Streams one result message's rows into the merge table. Any number
    /// of `merge` calls may run concurrently, bounded by `conn_budget`
    /// (spec.md section 4.7).
    pub async fn merge(&self, result: qserv_proto::Result) -> Result<MergeOutcome, DispatchError> {
        if self.failed.load(Ordering::Acquire) {
            return Ok(MergeOutcome::Skipped); // fast no-op after a fatal size-cap failure
        }
        let jia = self.job_id_attempt(result.job_id, result.attempt_count as u32);
        if self.invalid_attempts.lock().contains(&jia) {
            return Ok(MergeOutcome::Skipped);
        }

        self.wait_for_scrub_gate_clear().await;
        let _permit = self
            .conn_budget
            .acquire()
            .await
            .map_err(|_| DispatchError::MergeSql("connection budget semaphore closed".into()))?;
        self.enter_merge();

        // Re-check after acquiring the gate: a scrub may have landed for
        // this exact attempt while we were waiting on the semaphore.
        if self.invalid_attempts.lock().contains(&jia) {
            self.leave_merge();
            return Ok(MergeOutcome::Skipped);
        }

        let row_count = result.rows.len() as u64;
        let bytes: u64 = result.rows.iter().map(|r| r.len() as u64).sum();
        let insert_result = self.sink.insert_rows(jia, &result.rows).await;
        self.leave_merge();

        let written_bytes = insert_result?;
        let total = self.merged_bytes.fetch_add(written_bytes, Ordering::SeqCst) + written_bytes;
        self.merged_rows.fetch_add(row_count as i64, Ordering::SeqCst);
        if total > self.config.max_merged_bytes {
            self.failed.store(true, Ordering::SeqCst);
            return Err(DispatchError::MergeSizeExceeded {
                used: total,
                limit: self.config.max_merged_bytes,
            });
        }
        let _ = bytes;
        Ok(MergeOutcome::Merged { rows: row_count })
    }

    /// Marks `(jobId, attempt)` invalid and deletes any rows already merged
    /// for it, blocking new merges for that attempt meanwhile (spec.md
    /// section 4.7).
    pub async fn prep_scrub(&self, job_id: i32, attempt: u32) -> Result<(), DispatchError> {
        let jia = self.job_id_attempt(job_id, attempt);
        self.invalid_attempts.lock().insert(jia);

        {
            let mut gate = self.gate.lock();
            gate.holding = true;
        }
        loop {
            let notified = self.gate_changed.notified();
            if self.gate.lock().concurrent_merges == 0 {
                break;
            }
            notified.await;
        }

        let result = self.sink.delete_attempts(&[jia]).await;

        let mut gate = self.gate.lock();
        gate.holding = false;
        drop(gate);
        self.gate_changed.notify_waiters();
        result
    }

    /// Runs the merge/aggregation step and returns final byte and row
    /// counts. Waits for any in-flight `prep_scrub` to finish deleting its
    /// rows first, so an invalid attempt's rows can never still be present
    /// when this returns (spec.md section 4.7, "Exactly-once rows").
    pub async fn finalize(&self) -> Result<(u64, u64), DispatchError> {
        self.wait_for_scrub_gate_clear().await;
        if self.failed.load(Ordering::Acquire) {
            return Err(DispatchError::MergeSizeExceeded {
                used: self.merged_bytes.load(Ordering::Acquire),
                limit: self.config.max_merged_bytes,
            });
        }
        self.sink.finalize().await
    }

    pub fn merged_byte_count(&self) -> u64 {
        self.merged_bytes.load(Ordering::Acquire)
    }

    pub fn merged_row_count(&self) -> i64 {
        self.merged_rows.load(Ordering::Acquire)
    }

    async fn wait_for_scrub_gate_clear(&self) {
        loop {
            let notified = self.gate_changed.notified();
            if !self.gate.lock().holding {
                return;
            }
            notified.await;
        }
    }

    fn enter_merge(&self) {
        self.gate.lock().concurrent_merges += 1;
    }

    fn leave_merge(&self) {
        let mut gate = self.gate.lock();
        gate.concurrent_merges -= 1;
        let hit_zero = gate.concurrent_merges == 0;
        drop(gate);
        if hit_zero {
            self.gate_changed.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_merger(max_merged_bytes: u64) -> (Arc<InfileMerger>, Arc<InMemoryMergeSink>) {
        let sink = InMemoryMergeSink::new();
        let merger = InfileMerger::new(
            sink.clone(),
            InfileMergerConfig {
                max_job_attempts: 5,
                max_merged_bytes,
                max_connections: 4,
            },
        );
        (merger, sink)
    }

    fn result(job_id: i32, attempt: u32, row_count: i32) -> qserv_proto::Result {
        qserv_proto::Result {
            query_id: 1,
            job_id,
            attempt_count: attempt as i32,
            row_count,
            transmit_size: (row_count * 8) as i64,
            rows: (0..row_count).map(|_| vec![0u8; 8]).collect(),
            error_code: 0,
            error_msg: String::new(),
        }
    }

    #[tokio::test]
    async fn merges_rows_and_counts_them() {
        let (merger, sink) = make_merger(u64::MAX);
        let outcome = merger.merge(result(0, 0, 100)).await.unwrap();
        assert_eq!(outcome, MergeOutcome::Merged { rows: 100 });
        assert_eq!(sink.total_rows(), 100);
    }

    #[tokio::test]
    async fn prep_scrub_deletes_already_merged_rows_then_merge_is_a_no_op() {
        let (merger, sink) = make_merger(u64::MAX);
        merger.merge(result(5, 0, 20)).await.unwrap();
        assert_eq!(sink.total_rows(), 20);

        merger.prep_scrub(5, 0).await.unwrap();
        assert_eq!(sink.total_rows(), 0, "scrub must delete the invalid attempt's rows");

        let outcome = merger.merge(result(5, 0, 20)).await.unwrap();
        assert_eq!(outcome, MergeOutcome::Skipped);
        assert_eq!(sink.total_rows(), 0);
    }

    #[tokio::test]
    async fn exceeding_the_byte_cap_fails_the_query_and_later_merges_are_no_ops() {
        let (merger, _sink) = make_merger(32);
        let err = merger.merge(result(0, 0, 100)).await.unwrap_err();
        assert!(matches!(err, DispatchError::MergeSizeExceeded { .. }));

        let outcome = merger.merge(result(1, 0, 10)).await.unwrap();
        assert_eq!(outcome, MergeOutcome::Skipped);
        assert!(merger.finalize().await.is_err());
    }

    #[tokio::test]
    async fn zero_row_result_is_a_no_op_merge() {
        let (merger, sink) = make_merger(u64::MAX);
        let outcome = merger.merge(result(2, 0, 0)).await.unwrap();
        assert_eq!(outcome, MergeOutcome::Merged { rows: 0 });
        assert_eq!(sink.total_rows(), 0);
    }
}
