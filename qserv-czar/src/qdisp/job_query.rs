//! `JobQuery`: one `(chunk, attempt)` pair (spec.md section 4.4). Owns the
//! per-chunk payload, the current `QueryRequest`, and the retry counter.

use super::executive::Executive;
use super::query_request::QueryRequest;
use qserv_common::error::DispatchError;
use qserv_common::ids::{ChunkId, JobId};
use qserv_common::status::{JobStateCode, JobStatus};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct JobDescription {
    pub job_id: JobId,
    pub chunk_id: ChunkId,
    pub worker_addr: String,
    pub fragment_sql: String,
    pub subchunk_sql: String,
    pub scan_tables: Vec<String>,
    pub priority: i32,
    pub interactive: bool,
}

pub struct JobQuery {
    pub job_id: JobId,
    pub desc: JobDescription,
    pub status: JobStatus,
    executive: Arc<Executive>,
    attempt: AtomicU32,
    cancelled: AtomicBool,
    mark_complete_called: AtomicBool,
    current_request: parking_lot::Mutex<Option<Arc<QueryRequest>>>,
}

impl JobQuery {
    pub fn new(executive: Arc<Executive>, desc: JobDescription) -> Arc<Self> {
        Arc::new(Self {
            job_id: desc.job_id,
            desc,
            status: JobStatus::new(),
            executive,
            attempt: AtomicU32::new(0),
            cancelled: AtomicBool::new(false),
            mark_complete_called: AtomicBool::new(false),
            current_request: parking_lot::Mutex::new(None),
        })
    }

    pub fn query_id(&self) -> u64 {
        self.executive.query_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn current_attempt(&self) -> u32 {
        self.attempt.load(Ordering::Acquire)
    }

    /// Returns `true` the first time it's called for this job, `false`
    /// every subsequent call — enforces "At-most-once mark-complete"
    /// (spec.md section 3) even if two attempts race to finish.
    pub(super) fn mark_complete_once(&self) -> bool {
        self.mark_complete_called
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Creates a fresh `QueryRequest`, publishes it (replacing any prior
    /// one), and dispatches through the transport. Returns `false` iff the
    /// retry budget is exhausted (spec.md section 4.4).
    pub fn run_job(self: &Arc<Self>) -> bool {
        if self.attempt.load(Ordering::Acquire) >= self.executive.config.max_job_attempts {
            self.status.update_info(
                JobStateCode::ResultError,
                Some("attempt limit reached".into()),
            );
            self.executive.mark_completed(
                self.job_id,
                false,
                Some(DispatchError::AttemptLimitReached(
                    self.executive.config.max_job_attempts,
                )),
            );
            return false;
        }
        if self.is_cancelled() || self.executive.is_cancelled() {
            self.status.update_info(JobStateCode::CancelledState, None);
            self.executive.mark_completed(self.job_id, false, Some(DispatchError::Cancelled));
            return false;
        }

        let attempt_count = self.attempt.fetch_add(1, Ordering::SeqCst);
        self.status.update_info(JobStateCode::Queued, None);
        let request = QueryRequest::new(Arc::downgrade(self), attempt_count);
        *self.current_request.lock() = Some(request.clone());
        request.dispatch();
        true
    }

    /// Marks this job cancelled and forwards cancellation to the current
    /// `QueryRequest`. Idempotent (spec.md section 4.5).
    pub fn cancel(self: &Arc<Self>) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.status.update_info(JobStateCode::CancelledState, None);
        let current = self.current_request.lock().clone();
        match current {
            Some(req) => req.cancel(),
            // No attempt in flight (e.g. cancelled before the first
            // dispatch) — nothing will otherwise mark this job complete.
            None => self.executive.mark_completed(self.job_id, false, Some(DispatchError::Cancelled)),
        }
    }

    /// Called by the active `QueryRequest` when its attempt ends.
    /// Non-deterministic, retryable failures get another attempt; anything
    /// else marks the job permanently failed (spec.md section 4.4, "Retry
    /// rules"). Before retrying, any rows the failed attempt already merged
    /// are scrubbed (spec.md section 4.7) so a later-successful attempt's
    /// rows are never double-counted.
    pub async fn attempt_failed(self: &Arc<Self>, attempt_count: u32, error: DispatchError) {
        let retryable = error.is_retryable();
        if retryable && !self.is_cancelled() && !self.executive.is_cancelled() {
            if let Err(e) = self.executive.merger.prep_scrub(self.job_id, attempt_count).await {
                tracing::warn!(job_id = self.job_id, attempt_count, error = %e, "prep_scrub failed before retry");
            }
            if self.run_job() {
                return;
            }
            // run_job() itself marked the job complete (attempt limit or
            // cancellation discovered at dispatch time).
            return;
        }
        self.status.update_info(JobStateCode::ResultError, Some(error.to_string()));
        self.executive.mark_completed(self.job_id, false, Some(error));
    }

    pub fn attempt_succeeded(&self) {
        self.status.update_info(JobStateCode::Complete, None);
        self.executive.mark_completed(self.job_id, true, None);
    }

    pub(super) fn executive(&self) -> &Arc<Executive> {
        &self.executive
    }
}
