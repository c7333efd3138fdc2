//! In-process fake transport used by `qserv-czar`'s integration tests
//! (spec.md section 8's concrete scenarios are all exercised through this).
//! No network, no real worker process: each `dispatch` call looks up a
//! scripted [`ScriptedResponse`] keyed by `(query_id, job_id)` and replays
//! it as a stream, counting attempts so per-attempt scripts (e.g. "fail on
//! attempt 0, succeed on attempt 1") can be expressed.

use super::{ResponseItem, ResponseStream, Transport, TransportError};
use dashmap::DashMap;
use futures::stream;
use parking_lot::Mutex;
use qserv_proto::{ProtoHeader, Request, Result as WireResult};
use std::sync::Arc;

/// What one dispatch attempt for `(query_id, job_id)` should do.
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    /// Stream `rows_per_message` rows in each of `num_messages` messages,
    /// then a `last = true` header.
    Rows { num_messages: u32, rows_per_message: u32 },
    /// The transport itself fails (connection drop, timeout) — retryable.
    TransportError,
    /// Streams `rows` rows in one message, then the transport drops
    /// (spec.md section 8 scenario 2: "returns a transport error after 20
    /// rows merged").
    RowsThenTransportError { rows: u32 },
    /// The worker reports a SQL/schema error — not retryable.
    WorkerError { code: i32, message: String },
}

#[derive(Debug, Clone)]
pub struct ScriptedResponse {
    /// One outcome per attempt, in order; the last entry repeats if there
    /// are more attempts than scripted outcomes.
    pub outcomes: Vec<ScriptedOutcome>,
}

#[derive(Debug, Default)]
pub struct FakeTransport {
    scripts: DashMap<(u64, i32), ScriptedResponse>,
    attempts_seen: DashMap<(u64, i32), u32>,
    cancelled: DashMap<(u64, i32, u32), ()>,
    dispatched: Mutex<Vec<(u64, i32, u32)>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, query_id: u64, job_id: i32, response: ScriptedResponse) {
        self.scripts.insert((query_id, job_id), response);
    }

    pub fn was_cancelled(&self, query_id: u64, job_id: i32, attempt_count: u32) -> bool {
        self.cancelled.contains_key(&(query_id, job_id, attempt_count))
    }

    pub fn dispatched_attempts(&self) -> Vec<(u64, i32, u32)> {
        self.dispatched.lock().clone()
    }
}

#[async_trait::async_trait]
impl Transport for FakeTransport {
    async fn dispatch(
        &self,
        _worker_addr: &str,
        request: Request,
    ) -> std::result::Result<ResponseStream, TransportError> {
        let key = (request.query_id as u64, request.job_id);
        self.dispatched
            .lock()
            .push((request.query_id as u64, request.job_id, request.attempt_count as u32));

        let mut seen = self.attempts_seen.entry(key).or_insert(0);
        let attempt_index = *seen as usize;
        *seen += 1;

        let script = self
            .scripts
            .get(&key)
            .ok_or_else(|| TransportError::Connect(format!("no script for job {key:?}")))?;
        let outcome = script
            .outcomes
            .get(attempt_index)
            .or_else(|| script.outcomes.last())
            .cloned()
            .ok_or_else(|| TransportError::Connect("empty script".into()))?;
        drop(script);

        let attempt_count = request.attempt_count;
        let items: Vec<std::result::Result<ResponseItem, TransportError>> = match outcome {
            ScriptedOutcome::TransportError => vec![Err(TransportError::Rpc("connection reset".into()))],
            ScriptedOutcome::RowsThenTransportError { rows } => vec![
                Ok(ResponseItem::Header(ProtoHeader {
                    payload_size: rows as u64,
                    last: false,
                    error_code: 0,
                    error_msg: String::new(),
                    attempt_count,
                })),
                Ok(ResponseItem::Data(WireResult {
                    query_id: request.query_id,
                    job_id: request.job_id,
                    attempt_count,
                    row_count: rows as i32,
                    transmit_size: (rows * 8) as i64,
                    rows: (0..rows).map(|_| vec![0u8; 8]).collect(),
                    error_code: 0,
                    error_msg: String::new(),
                })),
                Err(TransportError::Rpc("connection reset".into())),
            ],
            ScriptedOutcome::WorkerError { code, message } => vec![
                Ok(ResponseItem::Header(ProtoHeader {
                    payload_size: 0,
                    last: true,
                    error_code: code,
                    error_msg: message.clone(),
                    attempt_count,
                })),
                Ok(ResponseItem::Data(WireResult {
                    query_id: request.query_id,
                    job_id: request.job_id,
                    attempt_count,
                    row_count: 0,
                    transmit_size: 0,
                    rows: vec![],
                    error_code: code,
                    error_msg: message,
                })),
            ],
            ScriptedOutcome::Rows { num_messages, rows_per_message } => {
                let mut out = Vec::new();
                for i in 0..num_messages {
                    let last = i + 1 == num_messages;
                    out.push(Ok(ResponseItem::Header(ProtoHeader {
                        payload_size: rows_per_message as u64,
                        last: false,
                        error_code: 0,
                        error_msg: String::new(),
                        attempt_count,
                    })));
                    out.push(Ok(ResponseItem::Data(WireResult {
                        query_id: request.query_id,
                        job_id: request.job_id,
                        attempt_count,
                        row_count: rows_per_message as i32,
                        transmit_size: (rows_per_message * 64) as i64,
                        rows: (0..rows_per_message).map(|_| vec![0u8; 8]).collect(),
                        error_code: 0,
                        error_msg: String::new(),
                    })));
                    if last {
                        out.push(Ok(ResponseItem::Header(ProtoHeader {
                            payload_size: 0,
                            last: true,
                            error_code: 0,
                            error_msg: String::new(),
                            attempt_count,
                        })));
                    }
                }
                out
            }
        };

        Ok(Box::pin(stream::iter(items)))
    }

    async fn cancel(&self, query_id: u64, job_id: i32, attempt_count: u32) {
        self.cancelled.insert((query_id, job_id, attempt_count), ());
    }
}
