//! End-to-end scenarios wired through `FakeTransport` (spec.md section 8's
//! concrete scenarios 1-4 and 6; scenario 5, the priority-class starvation
//! floor, is exercised directly against `QdispPool` in its own unit tests).

use qserv_czar::qdisp::{Executive, ExecutiveConfig, JobDescription, PseudoFifo, QdispPool, QueryState};
use qserv_czar::rproc::{InMemoryMergeSink, InfileMerger, InfileMergerConfig};
use qserv_czar::transport::fake::{FakeTransport, ScriptedOutcome, ScriptedResponse};
use std::sync::Arc;

fn new_executive(transport: Arc<FakeTransport>, row_limit: Option<u64>) -> (Arc<Executive>, Arc<InMemoryMergeSink>) {
    let sink = InMemoryMergeSink::new();
    let merger = InfileMerger::new(
        sink.clone(),
        InfileMergerConfig {
            max_job_attempts: 5,
            max_merged_bytes: u64::MAX,
            max_connections: 8,
        },
    );
    let pool = QdispPool::new(8, vec![4, 2, 2, 1]);
    let pseudo_fifo = PseudoFifo::new(32);
    let executive = Executive::new(
        1,
        ExecutiveConfig { max_job_attempts: 5, row_limit },
        transport,
        merger,
        pool,
        pseudo_fifo,
    );
    (executive, sink)
}

fn job_desc(job_id: i32, chunk_id: i32) -> JobDescription {
    JobDescription {
        job_id,
        chunk_id,
        worker_addr: "http://worker-1:50051".into(),
        fragment_sql: "SELECT * FROM Object".into(),
        subchunk_sql: String::new(),
        scan_tables: vec!["Object".into()],
        priority: 1,
        interactive: false,
    }
}

#[tokio::test]
async fn happy_path_three_chunks() {
    let transport = FakeTransport::new();
    for job_id in 0..3 {
        transport.script(
            1,
            job_id,
            ScriptedResponse {
                outcomes: vec![ScriptedOutcome::Rows { num_messages: 1, rows_per_message: 100 }],
            },
        );
    }
    let (executive, _sink) = new_executive(transport, None);
    for job_id in 0..3 {
        executive.add(job_desc(job_id, job_id));
    }

    let state = executive.join().await;
    assert!(matches!(state, QueryState::Success));
    assert_eq!(executive.merged_row_count(), 300);
}

#[tokio::test]
async fn job_retries_and_succeeds_after_transport_error() {
    let transport = FakeTransport::new();
    transport.script(
        1,
        0,
        ScriptedResponse { outcomes: vec![ScriptedOutcome::Rows { num_messages: 1, rows_per_message: 100 }] },
    );
    // B merges 20 rows on attempt 0, then the transport drops; attempt 1
    // retries and succeeds with a fresh 100-row result (spec.md section 8
    // scenario 2).
    transport.script(
        1,
        1,
        ScriptedResponse {
            outcomes: vec![
                ScriptedOutcome::RowsThenTransportError { rows: 20 },
                ScriptedOutcome::Rows { num_messages: 1, rows_per_message: 100 },
            ],
        },
    );
    transport.script(
        1,
        2,
        ScriptedResponse { outcomes: vec![ScriptedOutcome::Rows { num_messages: 1, rows_per_message: 100 }] },
    );
    let (executive, sink) = new_executive(transport, None);
    for job_id in 0..3 {
        executive.add(job_desc(job_id, job_id));
    }

    let state = executive.join().await;
    assert!(matches!(state, QueryState::Success));
    assert_eq!(sink.total_rows(), 300, "the scrubbed 20-row attempt must not survive in the merge table");
    let (_bytes, finalize_rows) = executive.merger.finalize().await.unwrap();
    assert_eq!(finalize_rows, 300);
}

#[tokio::test]
async fn cancellation_mid_stream_yields_cancelled_and_no_further_merges() {
    let transport = FakeTransport::new();
    // A large number of messages gives plenty of room to cancel mid-stream.
    transport.script(
        1,
        0,
        ScriptedResponse { outcomes: vec![ScriptedOutcome::Rows { num_messages: 50, rows_per_message: 1 }] },
    );
    let (executive, _sink) = new_executive(transport, None);
    executive.add(job_desc(0, 0));

    tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    executive.cancel();

    let state = executive.join().await;
    assert!(matches!(state, QueryState::Cancelled));
}

#[tokio::test]
async fn limit_row_complete_stops_once_threshold_reached() {
    let transport = FakeTransport::new();
    for job_id in 0..3 {
        transport.script(
            1,
            job_id,
            ScriptedResponse {
                outcomes: vec![ScriptedOutcome::Rows { num_messages: 1, rows_per_message: 100 }],
            },
        );
    }
    let (executive, _sink) = new_executive(transport, Some(100));
    for job_id in 0..3 {
        executive.add(job_desc(job_id, job_id));
    }

    let state = executive.join().await;
    assert!(matches!(state, QueryState::Success));
    assert!(executive.merged_row_count() >= 100);
    assert!(executive.is_limit_row_complete());
}

#[tokio::test]
async fn worker_error_is_not_retried_and_fails_the_query() {
    let transport = FakeTransport::new();
    transport.script(
        1,
        0,
        ScriptedResponse {
            outcomes: vec![ScriptedOutcome::WorkerError { code: 500, message: "bad SQL".into() }],
        },
    );
    let (executive, _sink) = new_executive(transport.clone(), None);
    executive.add(job_desc(0, 0));

    let state = executive.join().await;
    assert!(matches!(state, QueryState::Error(_)));
    // Exactly one dispatch attempt: a non-retryable worker error does not
    // trigger another attempt (spec.md section 4.4, "Retry rules").
    assert_eq!(transport.dispatched_attempts().len(), 1);
}
