//! `FileChannelShared`: writes protobuf-framed rows into a result file on
//! the worker instead of streaming them, for very large results (spec.md
//! section 4.6). The czar fetches the file out of band; only a short
//! completion/error message goes over the RPC channel. File names are
//! deterministic from `(queryId, jobId, chunkId, attemptCount)`; a partial
//! file is deleted on error (grounded on
//! `examples/original_source/src/wbase/FileChannelShared.h`'s destructor
//! contract: "if it didn't happen then the file is meaningless and it must
//! be gone").

use crate::channel_shared::{ChannelShared, WireItem};
use crate::task::Task;
use async_trait::async_trait;
use prost::Message;
use qserv_common::error::DispatchError;
use qserv_common::fifo_gate::FifoGate;
use qserv_common::ids::{ChunkId, JobId, QueryId};
use qserv_proto::{ProtoHeader, StreamItem};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

pub fn result_file_name(dir: &std::path::Path, query_id: QueryId, job_id: JobId, chunk_id: ChunkId, attempt_count: u32) -> PathBuf {
    dir.join(format!("qserv-result-{query_id}-{job_id}-{chunk_id}-{attempt_count}.pb"))
}

struct FileState {
    file: Option<tokio::fs::File>,
    bytes_written: u64,
}

pub struct FileChannelShared {
    gate: Arc<FifoGate>,
    tx: mpsc::Sender<WireItem>,
    path: PathBuf,
    state: AsyncMutex<FileState>,
    remaining_tasks: AtomicUsize,
    last_sent: AtomicBool,
    cancelled: AtomicBool,
}

impl FileChannelShared {
    pub fn new(
        tx: mpsc::Sender<WireItem>,
        path: PathBuf,
        contributor_count: usize,
        transmit_concurrency: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            gate: FifoGate::new(transmit_concurrency),
            tx,
            path,
            state: AsyncMutex::new(FileState { file: None, bytes_written: 0 }),
            remaining_tasks: AtomicUsize::new(contributor_count.max(1)),
            last_sent: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        })
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    async fn write_framed(&self, state: &mut FileState, header: &ProtoHeader, result: &qserv_proto::Result) -> Result<(), DispatchError> {
        if state.file.is_none() {
            let file = tokio::fs::File::create(&self.path)
                .await
                .map_err(|e| DispatchError::InvariantViolation(format!("cannot create result file: {e}")))?;
            state.file = Some(file);
        }
        let file = state.file.as_mut().expect("just created above");

        let mut header_buf = Vec::new();
        header.encode(&mut header_buf).expect("protobuf encode is infallible for valid messages");
        let mut data_buf = Vec::new();
        result.encode(&mut data_buf).expect("protobuf encode is infallible for valid messages");

        for buf in [&header_buf, &data_buf] {
            file.write_all(&(buf.len() as u32).to_be_bytes())
                .await
                .map_err(|e| DispatchError::InvariantViolation(e.to_string()))?;
            file.write_all(buf).await.map_err(|e| DispatchError::InvariantViolation(e.to_string()))?;
            state.bytes_written += 4 + buf.len() as u64;
        }
        Ok(())
    }

    async fn delete_partial(&self) {
        let _ = tokio::fs::remove_file(&self.path).await;
    }

    /// Sends the short completion/error notice over the RPC channel once
    /// the file is closed.
    async fn notify_done(&self, error_code: i32, error_msg: String) -> Result<(), DispatchError> {
        let item = StreamItem {
            body: Some(qserv_proto::stream_item::Body::Header(ProtoHeader {
                payload_size: 0,
                last: true,
                error_code,
                error_msg,
                attempt_count: 0,
            })),
        };
        self.tx
            .send(Ok(item))
            .await
            .map_err(|_| DispatchError::Transport("response channel closed".into()))
    }
}

#[async_trait]
impl ChannelShared for FileChannelShared {
    async fn transmit(&self, _task: &Task, result: qserv_proto::Result, task_done: bool) -> Result<(), DispatchError> {
        if self.is_cancelled() {
            self.delete_partial().await;
            return Err(DispatchError::Cancelled);
        }
        let _handle = self.gate.queue_and_wait().await;

        let is_final = task_done && self.remaining_tasks.fetch_sub(1, Ordering::SeqCst) == 1;
        let had_error = result.error_code != 0;

        let header = ProtoHeader {
            payload_size: result.transmit_size.max(0) as u64,
            last: is_final,
            error_code: result.error_code,
            error_msg: result.error_msg.clone(),
            attempt_count: result.attempt_count,
        };

        let mut state = self.state.lock().await;
        if let Err(e) = self.write_framed(&mut state, &header, &result).await {
            drop(state);
            self.delete_partial().await;
            return Err(e);
        }

        if is_final || had_error {
            if let Some(mut file) = state.file.take() {
                let _ = file.flush().await;
            }
            drop(state);
            if had_error {
                self.delete_partial().await;
            }
            if is_final && self.last_sent.swap(true, Ordering::SeqCst) {
                return Err(DispatchError::InvariantViolation(
                    "a second completion notice would have been sent".into(),
                ));
            }
            self.notify_done(result.error_code, result.error_msg).await?;
        }
        Ok(())
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}
