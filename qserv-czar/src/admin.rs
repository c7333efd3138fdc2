//! Admin HTTP surface (spec.md section 6): read-only, unauthenticated,
//! JSON-over-`axum` — mirrors the teacher's admin-plane-as-a-separate-router
//! pattern (a small side router mounted next to the main serving path,
//! rather than folded into query dispatch).

use crate::qdisp::{Executive, JobDescription, QueryState};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use dashmap::DashMap;
use qserv_common::ids::{ChunkId, JobId, QueryId};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Builds a fresh `Executive` for a newly submitted `UserQuery`. Supplied by
/// `main.rs`, which closes over the shared `QdispPool`/`PseudoFifo`/
/// transport and the per-query `InfileMerger` construction (query analysis —
/// chunking, the merge statement, the result schema — stays an external
/// collaborator per spec.md section 1; this factory is the seam where that
/// collaborator's output is handed in).
pub type ExecutiveFactory = Arc<dyn Fn(QueryId, Option<u64>) -> Arc<Executive> + Send + Sync>;

#[derive(Clone)]
pub struct AdminState {
    pub queries: Arc<DashMap<QueryId, Arc<Executive>>>,
    pub worker_addrs: Arc<Vec<String>>,
    pub next_query_id: Arc<AtomicU64>,
    pub new_executive: ExecutiveFactory,
}

impl AdminState {
    pub fn new(worker_addrs: Vec<String>, new_executive: ExecutiveFactory) -> Self {
        Self {
            queries: Arc::new(DashMap::new()),
            worker_addrs: Arc::new(worker_addrs),
            next_query_id: Arc::new(AtomicU64::new(1)),
            new_executive,
        }
    }
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/workers", get(list_workers))
        .route("/queries", get(list_queries).post(submit_query))
        .route("/queries/:id", get(get_query))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct JobSubmission {
    pub job_id: JobId,
    pub chunk_id: ChunkId,
    pub worker_addr: String,
    pub fragment_sql: String,
    #[serde(default)]
    pub subchunk_sql: String,
    #[serde(default)]
    pub scan_tables: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub interactive: bool,
}

#[derive(Debug, Deserialize)]
pub struct QuerySubmission {
    pub jobs: Vec<JobSubmission>,
    #[serde(default)]
    pub row_limit: Option<u64>,
}

#[derive(Serialize)]
struct SubmitResponse {
    query_id: QueryId,
}

/// Accepts a pre-chunked `UserQuery` (the per-chunk SQL fragments and result
/// schema are produced by the external query-analysis layer, spec.md
/// section 1) and dispatches it. Returns immediately with the assigned
/// `queryId`; the submitter polls `GET /queries/:id` for completion, mirroring
/// spec.md section 3's "async flag" on `UserQuery`.
async fn submit_query(
    State(state): State<AdminState>,
    Json(body): Json<QuerySubmission>,
) -> impl IntoResponse {
    let query_id = state.next_query_id.fetch_add(1, Ordering::SeqCst);
    let executive = (state.new_executive)(query_id, body.row_limit);
    state.queries.insert(query_id, executive.clone());

    for job in body.jobs {
        executive.add(JobDescription {
            job_id: job.job_id,
            chunk_id: job.chunk_id,
            worker_addr: job.worker_addr,
            fragment_sql: job.fragment_sql,
            subchunk_sql: job.subchunk_sql,
            scan_tables: job.scan_tables,
            priority: job.priority,
            interactive: job.interactive,
        });
    }

    let retire_state = state.clone();
    tokio::spawn(async move {
        let final_state = executive.join().await;
        if matches!(final_state, QueryState::Success) {
            if let Err(e) = executive.merger.finalize().await {
                tracing::error!(query_id, error = %e, "finalize failed after join succeeded");
            }
        }
        retire(&retire_state, query_id, &final_state).await;
    });

    Json(SubmitResponse { query_id })
}

async fn list_workers(State(state): State<AdminState>) -> impl IntoResponse {
    Json(state.worker_addrs.as_ref().clone())
}

#[derive(Serialize)]
struct QuerySummary {
    query_id: QueryId,
    outstanding: i64,
    merged_rows: u64,
}

async fn list_queries(State(state): State<AdminState>) -> impl IntoResponse {
    let summaries: Vec<QuerySummary> = state
        .queries
        .iter()
        .map(|entry| QuerySummary {
            query_id: *entry.key(),
            outstanding: entry.value().outstanding_count(),
            merged_rows: entry.value().merged_row_count(),
        })
        .collect();
    Json(summaries)
}

#[derive(Serialize)]
struct QueryDetail {
    query_id: QueryId,
    outstanding: i64,
    merged_rows: u64,
    jobs: Vec<crate::qdisp::executive::JobSnapshot>,
    messages: Vec<qserv_common::message_store::QueryMessage>,
}

async fn get_query(
    State(state): State<AdminState>,
    Path(query_id): Path<QueryId>,
) -> impl IntoResponse {
    match state.queries.get(&query_id) {
        Some(executive) => {
            let executive = executive.value().clone();
            let detail = QueryDetail {
                query_id,
                outstanding: executive.outstanding_count(),
                merged_rows: executive.merged_row_count(),
                jobs: executive.jobs_snapshot(),
                messages: executive.messages.all(),
            };
            Json(detail).into_response()
        }
        None => axum::http::StatusCode::NOT_FOUND.into_response(),
    }
}

/// Called once a query's `Executive` has reached a terminal state. The
/// `UserQuery` entry is left in the registry so `GET /queries/:id` keeps
/// answering after completion — eventual eviction is a garbage-collection
/// policy spec.md section 1 explicitly leaves unspecified.
pub async fn retire(_state: &AdminState, query_id: QueryId, final_state: &QueryState) {
    tracing::info!(query_id, state = ?final_state, "query retired");
}
