//! `Executive`: owns all `JobQuery`s for one `UserQuery` (spec.md section
//! 4.3). Implements the UserQuery-level state machine from spec.md section
//! 4.3 and the "limit-row complete" squashing optimization.

use super::job_query::{JobDescription, JobQuery};
use super::pseudo_fifo::PseudoFifo;
use super::qdisp_pool::QdispPool;
use crate::rproc::infile_merger::InfileMerger;
use crate::transport::SharedTransport;
use dashmap::DashMap;
use qserv_common::error::DispatchError;
use qserv_common::ids::{JobId, QueryId};
use qserv_common::message_store::MessageStore;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Terminal/`RUNNING` states for one `UserQuery` (spec.md section 4.3 state
/// machine diagram).
#[derive(Debug, Clone)]
pub enum QueryState {
    Running,
    Success,
    Error(DispatchError),
    Cancelled,
}

pub struct ExecutiveConfig {
    pub max_job_attempts: u32,
    pub row_limit: Option<u64>,
}

/// Owns every `JobQuery` for one `UserQuery`; tracks outstanding count,
/// cancellation, and limit-row-complete squashing.
pub struct Executive {
    pub query_id: QueryId,
    pub config: ExecutiveConfig,
    pub transport: SharedTransport,
    pub merger: Arc<InfileMerger>,
    pub messages: Arc<MessageStore>,
    pub pool: Arc<QdispPool>,
    pub pseudo_fifo: Arc<PseudoFifo>,

    jobs: DashMap<JobId, Arc<JobQuery>>,
    outstanding: AtomicI64,
    cancelled: AtomicBool,
    user_cancelled: AtomicBool,
    limit_row_complete: AtomicBool,
    merged_rows: AtomicU64,
    first_error: parking_lot::Mutex<Option<DispatchError>>,
    done: Notify,
}

impl Executive {
    pub fn new(
        query_id: QueryId,
        config: ExecutiveConfig,
        transport: SharedTransport,
        merger: Arc<InfileMerger>,
        pool: Arc<QdispPool>,
        pseudo_fifo: Arc<PseudoFifo>,
    ) -> Arc<Self> {
        Arc::new(Self {
            query_id,
            config,
            transport,
            merger,
            pool,
            pseudo_fifo,
            messages: Arc::new(MessageStore::new()),
            jobs: DashMap::new(),
            outstanding: AtomicI64::new(0),
            cancelled: AtomicBool::new(false),
            user_cancelled: AtomicBool::new(false),
            limit_row_complete: AtomicBool::new(false),
            merged_rows: AtomicU64::new(0),
            first_error: parking_lot::Mutex::new(None),
            done: Notify::new(),
        })
    }

    /// Creates the `JobQuery`, increments outstanding, and launches its
    /// first attempt. Idempotent on a duplicate `jobId` within this
    /// `UserQuery`: returns the existing `JobQuery` (spec.md section 4.3).
    pub fn add(self: &Arc<Self>, desc: JobDescription) -> Arc<JobQuery> {
        if let Some(existing) = self.jobs.get(&desc.job_id) {
            return existing.clone();
        }
        let job = JobQuery::new(self.clone(), desc);
        match self.jobs.entry(job.job_id) {
            dashmap::mapref::entry::Entry::Occupied(e) => return e.get().clone(),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(job.clone());
            }
        }
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        job.run_job();
        job
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn is_limit_row_complete(&self) -> bool {
        self.limit_row_complete.load(Ordering::Acquire)
    }

    /// Called by `InfileMerger` after each successful merge batch.
    pub fn add_result_rows(&self, n: u64) {
        let total = self.merged_rows.fetch_add(n, Ordering::SeqCst) + n;
        if let Some(limit) = self.config.row_limit {
            if total >= limit {
                self.limit_row_complete.store(true, Ordering::SeqCst);
            }
        }
    }

    /// Atomic cancel: flips the cancelled flag, cascades `cancel()` to every
    /// live `JobQuery`, and wakes any `join()` waiter (spec.md section 4.3).
    /// Used both by a user-initiated [`cancel`](Self::cancel) and by
    /// `mark_completed` on a fatal job failure — the two cases differ only
    /// in whether `user_cancelled` is also set, which is what `join()` uses
    /// to tell a CANCELLED terminal state apart from an ERROR one.
    fn squash(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return; // already squashed; cancel() is idempotent (spec.md section 4.5)
        }
        for entry in self.jobs.iter() {
            entry.value().cancel();
        }
        self.done.notify_waiters();
    }

    /// User-initiated cancellation (spec.md section 4.3): `join()` reports
    /// this as `QueryState::Cancelled` regardless of any error a job's
    /// in-flight cancellation races in as `first_error`.
    pub fn cancel(&self) {
        self.user_cancelled.store(true, Ordering::SeqCst);
        self.squash();
    }

    /// Decrements outstanding exactly once per `jobId`; records the first
    /// fatal error; wakes `join()` at zero (spec.md section 4.3).
    pub fn mark_completed(
        &self,
        job_id: JobId,
        success: bool,
        error: Option<DispatchError>,
    ) {
        if let Some(job) = self.jobs.get(&job_id) {
            if !job.mark_complete_once() {
                // spec.md section 3: "At-most-once mark-complete" — a second
                // call for the same job is a no-op.
                return;
            }
        }
        if !success {
            let mut first = self.first_error.lock();
            if first.is_none() {
                *first = error.clone();
            }
            drop(first);
            if let Some(e) = &error {
                self.messages.error(None, 0, e.to_string());
            }
            // Fatal job failure: squash the rest of the query (spec.md
            // section 4.3, "Failure policy").
            self.squash();
        }
        let remaining = self.outstanding.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining <= 0 {
            self.done.notify_waiters();
        }
    }

    /// Blocks until `outstanding == 0` or the query is user-cancelled.
    /// A fatal job failure also sets `cancelled` (to stop the rest of the
    /// query's jobs) but not `user_cancelled`, so it still surfaces here as
    /// `Error(first_error)` rather than `Cancelled` (spec.md section 4.3,
    /// "ERROR vs CANCELLED terminal states").
    pub async fn join(&self) -> QueryState {
        loop {
            if self.user_cancelled.load(Ordering::Acquire) {
                return QueryState::Cancelled;
            }
            if self.outstanding.load(Ordering::Acquire) <= 0 {
                return match self.first_error.lock().clone() {
                    Some(e) => QueryState::Error(e),
                    None => QueryState::Success,
                };
            }
            let notified = self.done.notified();
            // Re-check after registering interest to avoid missing a
            // notification fired between the loads above and this await.
            if self.user_cancelled.load(Ordering::Acquire) || self.outstanding.load(Ordering::Acquire) <= 0 {
                continue;
            }
            notified.await;
        }
    }

    pub fn merged_row_count(&self) -> u64 {
        self.merged_rows.load(Ordering::Acquire)
    }

    pub fn outstanding_count(&self) -> i64 {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Job-level status snapshot for the admin HTTP surface (spec.md section 6).
    pub fn jobs_snapshot(&self) -> Vec<JobSnapshot> {
        self.jobs
            .iter()
            .map(|entry| {
                let job = entry.value();
                let snap = job.status.snapshot();
                JobSnapshot {
                    job_id: job.job_id,
                    chunk_id: job.desc.chunk_id,
                    worker_addr: job.desc.worker_addr.clone(),
                    attempt: job.current_attempt(),
                    state: snap.code,
                    worker_message: snap.worker_message,
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub chunk_id: qserv_common::ids::ChunkId,
    pub worker_addr: String,
    pub attempt: u32,
    pub state: qserv_common::status::JobStateCode,
    pub worker_message: Option<String>,
}
