//! `QueryRequest`: drives one dispatch attempt through its response state
//! machine (spec.md section 4.5). In an async/await target the
//! command-plus-condition-variable `AskForResponseDataCmd` from the source
//! collapses into a single async loop (spec.md section 9, "Coroutine-like
//! control flow"); the phase names are preserved as a [`Phase`] enum purely
//! for observability/tracing, matching that note's instruction.

use super::job_query::JobQuery;
use crate::rproc::infile_merger::MergeOutcome;
use crate::transport::{ResponseItem, TransportError};
use qserv_common::error::DispatchError;
use qserv_proto::Request as WireRequest;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tracing::Span;
use tracing::Instrument;

/// Observability-only phase, named after the states in spec.md section 4.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    New,
    Sent,
    ImportStream,
    AwaitingData,
    Processing,
    Finishing,
    Dead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FinishStatus {
    Active,
    Finished,
    Error,
}

struct FinishState {
    status: FinishStatus,
    cancelled: bool,
}

/// One dispatch attempt. Held strongly by its `JobQuery` and, for the
/// duration of its spawned task, by itself (the task owns an `Arc<Self>` —
/// this is the Rust equivalent of the source's `_keepAlive` trick: the
/// object cannot be dropped out from under an in-flight callback because
/// the callback *is* what's holding the strong reference).
pub struct QueryRequest {
    job: Weak<JobQuery>,
    attempt_count: u32,
    finish: parking_lot::Mutex<FinishState>,
    phase: parking_lot::Mutex<Phase>,
    retried: AtomicBool,
    resp_count: AtomicU32,
    span: Span,
}

impl QueryRequest {
    pub fn new(job: Weak<JobQuery>, attempt_count: u32) -> Arc<Self> {
        let span = tracing::info_span!("query_request", attempt = attempt_count);
        Arc::new(Self {
            job,
            attempt_count,
            finish: parking_lot::Mutex::new(FinishState {
                status: FinishStatus::Active,
                cancelled: false,
            }),
            phase: parking_lot::Mutex::new(Phase::New),
            retried: AtomicBool::new(false),
            resp_count: AtomicU32::new(0),
            span,
        })
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock()
    }

    fn set_phase(&self, phase: Phase) {
        *self.phase.lock() = phase;
    }

    /// Idempotent, thread-safe from any caller (spec.md section 4.5,
    /// "Cancellation semantics"): sets cancelled + retried (blocking further
    /// retries from this attempt) and moves to an error finish.
    pub fn cancel(self: &Arc<Self>) {
        {
            let mut finish = self.finish.lock();
            if finish.cancelled {
                return;
            }
            finish.cancelled = true;
        }
        self.retried.store(true, Ordering::SeqCst);
        if let Some(job) = self.job.upgrade() {
            let executive = job.executive().clone();
            let query_id = job.query_id();
            let job_id = job.job_id;
            let attempt = self.attempt_count;
            tokio::spawn(async move {
                executive.transport.cancel(query_id, job_id, attempt).await;
            });
        }
        self.error_finish(DispatchError::Cancelled, true);
    }

    /// Builds the request payload and spawns the task that drives this
    /// attempt to completion. Returning immediately (rather than blocking
    /// the caller) is what lets `JobQuery::run_job` publish `self` before
    /// any callback can fire.
    pub fn dispatch(self: Arc<Self>) {
        let span = self.span.clone();
        tokio::spawn(
            async move {
                self.run().await;
            }
            .instrument(span),
        );
    }

    async fn run(self: Arc<Self>) {
        let Some(job) = self.job.upgrade() else {
            return;
        };
        let executive = job.executive().clone();
        let request = WireRequest {
            query_id: job.query_id() as i64,
            job_id: job.job_id,
            attempt_count: self.attempt_count as i32,
            czar_id: 0,
            chunk_id: job.desc.chunk_id,
            fragment_sql: job.desc.fragment_sql.clone(),
            subchunk_sql: job.desc.subchunk_sql.clone(),
            scan_tables: job.desc.scan_tables.clone(),
            priority: job.desc.priority,
            interactive: job.desc.interactive,
            protocol_version: qserv_proto::MIN_PROTOCOL_VERSION,
        };

        self.set_phase(Phase::Sent);
        let worker_addr = job.desc.worker_addr.clone();
        let stream = match executive.transport.dispatch(&worker_addr, request).await {
            Ok(s) => s,
            Err(e) => {
                self.fail_attempt(&job, transport_err_to_dispatch(e)).await;
                return;
            }
        };

        self.set_phase(Phase::ImportStream);
        if let Err(e) = self.import_stream(&job, stream).await {
            self.fail_attempt(&job, e).await;
            return;
        }

        self.finish_success(&job);
    }

    async fn import_stream(
        self: &Arc<Self>,
        job: &Arc<JobQuery>,
        mut stream: crate::transport::ResponseStream,
    ) -> Result<(), DispatchError> {
        use futures::StreamExt;
        let executive = job.executive();
        let priority_class = priority_to_class(job.desc.priority, job.desc.interactive);

        loop {
            if self.is_cancelled() || executive.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }

            self.set_phase(Phase::AwaitingData);
            let fifo = executive.pseudo_fifo.clone();
            let handle = fifo.queue_and_wait().await;
            let item = stream.next().await;
            drop(handle);

            let item = match item {
                Some(Ok(item)) => item,
                Some(Err(e)) => return Err(transport_err_to_dispatch(e)),
                None => return Err(DispatchError::InvariantViolation("stream ended without a last header".into())),
            };

            match item {
                ResponseItem::Header(header) => {
                    if header.error_code != 0 || !header.error_msg.is_empty() {
                        return Err(DispatchError::WorkerSql(header.error_msg));
                    }
                    if header.last {
                        return Ok(());
                    }
                    // A non-last header just announces the next payload's
                    // size (spec.md section 4.5, "Header chaining
                    // protocol"); the payload itself arrives as the next
                    // stream item, handled below.
                }
                ResponseItem::Data(result) => {
                    self.set_phase(Phase::Processing);
                    self.resp_count.fetch_add(1, Ordering::Relaxed);
                    if result.error_code != 0 {
                        return Err(DispatchError::WorkerSql(result.error_msg));
                    }
                    self.merge_on_pool(executive, priority_class, result).await?;
                }
            }
        }
    }

    /// Submits the merge work for one result message onto the `QdispPool`
    /// (spec.md section 4.5, "AskForResponseDataCmd"): merging can block on
    /// MySQL I/O, so it must not run inline with stream polling.
    async fn merge_on_pool(
        &self,
        executive: &Arc<super::executive::Executive>,
        priority_class: usize,
        result: qserv_proto::Result,
    ) -> Result<(), DispatchError> {
        if executive.is_limit_row_complete() {
            return Ok(());
        }
        let (tx, rx) = tokio::sync::oneshot::channel();
        let merger = executive.merger.clone();
        let executive_for_rows = executive.clone();
        executive.pool.submit(
            priority_class,
            Box::pin(async move {
                let outcome = merger.merge(result).await;
                if let Ok(MergeOutcome::Merged { rows }) = &outcome {
                    executive_for_rows.add_result_rows(*rows);
                }
                let _ = tx.send(outcome);
            }),
        );
        match rx.await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(DispatchError::Cancelled), // pool shut down before running the command
        }
    }

    async fn fail_attempt(self: &Arc<Self>, job: &Arc<JobQuery>, error: DispatchError) {
        self.error_finish(error.clone(), !error.is_retryable());
        job.attempt_failed(self.attempt_count, error).await;
    }

    fn finish_success(self: &Arc<Self>, job: &Arc<JobQuery>) {
        self.set_phase(Phase::Finishing);
        {
            let mut finish = self.finish.lock();
            if finish.status != FinishStatus::Active {
                self.set_phase(Phase::Dead);
                return;
            }
            finish.status = FinishStatus::Finished;
        }
        self.set_phase(Phase::Dead);
        job.attempt_succeeded();
    }

    /// Equivalent of `_errorFinish`: moves to a terminal error state exactly
    /// once. `stop_trying` blocks further retries from this particular
    /// attempt object (it does not by itself decide whether `JobQuery`
    /// retries — that's `attempt_failed`'s call).
    fn error_finish(self: &Arc<Self>, _reason: DispatchError, stop_trying: bool) {
        self.set_phase(Phase::Finishing);
        if stop_trying {
            self.retried.store(true, Ordering::SeqCst);
        }
        let mut finish = self.finish.lock();
        if finish.status != FinishStatus::Active {
            drop(finish);
            self.set_phase(Phase::Dead);
            return;
        }
        finish.status = FinishStatus::Error;
        drop(finish);
        self.set_phase(Phase::Dead);
    }

    fn is_cancelled(&self) -> bool {
        self.finish.lock().cancelled
    }
}

fn transport_err_to_dispatch(e: TransportError) -> DispatchError {
    match e {
        TransportError::Connect(msg) => DispatchError::Transport(msg),
        TransportError::UnexpectedEnd => DispatchError::Transport("stream ended unexpectedly".into()),
        TransportError::Rpc(msg) => DispatchError::WorkerBusy(msg),
        TransportError::Cancelled => DispatchError::Cancelled,
    }
}

/// Maps a job's priority/interactive flag onto a `QdispPool` class index.
/// Class 0 is reserved for interactive queries (spec.md section 4.1,
/// "starvation floor for background scan work").
fn priority_to_class(priority: i32, interactive: bool) -> usize {
    const MAX_CLASS: usize = 3; // matches the default 4-tier QdispPoolConfig
    if interactive {
        0
    } else {
        ((priority.max(0) as usize) + 1).min(MAX_CLASS)
    }
}
