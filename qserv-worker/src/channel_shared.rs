//! `ChannelShared`: a shared transmit channel used when multiple subchunk
//! Tasks of the same chunk contribute to one logical result stream (spec.md
//! section 4.6). Invariants: exactly one `last=true` header is ever
//! transmitted, and messages interleaved from contributing Tasks still form
//! a valid header-chained stream — achieved here by serializing each
//! header+payload pair through a `FifoGate` (the worker-side analogue of
//! `PseudoFifo`, spec.md section 4.6).

use crate::task::Task;
use async_trait::async_trait;
use qserv_common::error::DispatchError;
use qserv_common::fifo_gate::FifoGate;
use qserv_proto::{ProtoHeader, StreamItem};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

pub type WireItem = std::result::Result<StreamItem, tonic::Status>;

#[async_trait]
pub trait ChannelShared: Send + Sync {
    /// Transmits one batch of rows. `task_done` is this Task's own local
    /// completion flag; the channel decides whether that also makes this
    /// the stream-wide terminal message (spec.md section 4.6).
    async fn transmit(
        &self,
        task: &Task,
        result: qserv_proto::Result,
        task_done: bool,
    ) -> Result<(), DispatchError>;

    fn is_cancelled(&self) -> bool;
}

/// Streams framed messages directly over the worker's `tonic` response
/// channel.
pub struct StreamChannelShared {
    gate: Arc<FifoGate>,
    tx: mpsc::Sender<WireItem>,
    remaining_tasks: AtomicUsize,
    last_sent: AtomicBool,
    cancelled: AtomicBool,
}

impl StreamChannelShared {
    /// `contributor_count` is the number of subchunk Tasks that will call
    /// `transmit` on this channel before the stream is complete (1 for a
    /// plain, non-blended query).
    pub fn new(tx: mpsc::Sender<WireItem>, contributor_count: usize, transmit_concurrency: usize) -> Arc<Self> {
        Arc::new(Self {
            gate: FifoGate::new(transmit_concurrency),
            tx,
            remaining_tasks: AtomicUsize::new(contributor_count.max(1)),
            last_sent: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        })
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChannelShared for StreamChannelShared {
    async fn transmit(
        &self,
        _task: &Task,
        result: qserv_proto::Result,
        task_done: bool,
    ) -> Result<(), DispatchError> {
        if self.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }
        // Serializes header+payload pairs from however many Tasks share
        // this channel (spec.md section 4.6, "transmit command waits
        // inside the gate before calling the transport's send").
        let _handle = self.gate.queue_and_wait().await;

        let is_final = task_done && self.remaining_tasks.fetch_sub(1, Ordering::SeqCst) == 1;
        if is_final && self.last_sent.swap(true, Ordering::SeqCst) {
            return Err(DispatchError::InvariantViolation(
                "a second last=true header would have been transmitted".into(),
            ));
        }

        let header = ProtoHeader {
            payload_size: result.transmit_size.max(0) as u64,
            last: is_final,
            error_code: result.error_code,
            error_msg: result.error_msg.clone(),
            attempt_count: result.attempt_count,
        };
        let header_item = StreamItem {
            body: Some(qserv_proto::stream_item::Body::Header(header)),
        };
        let data_item = StreamItem {
            body: Some(qserv_proto::stream_item::Body::Result(result)),
        };
        self.tx
            .send(Ok(header_item))
            .await
            .map_err(|_| DispatchError::Transport("response channel closed".into()))?;
        self.tx
            .send(Ok(data_item))
            .await
            .map_err(|_| DispatchError::Transport("response channel closed".into()))?;
        Ok(())
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Task, TaskDescription};

    fn desc() -> TaskDescription {
        TaskDescription {
            query_id: 1,
            job_id: 7,
            attempt_count: 0,
            chunk_id: 3,
            fragment_index: 0,
            sql: "SELECT 1".into(),
            priority: 0,
            interactive: false,
            scan_tables: vec![],
        }
    }

    fn empty_result() -> qserv_proto::Result {
        qserv_proto::Result {
            query_id: 1,
            job_id: 7,
            attempt_count: 0,
            row_count: 0,
            transmit_size: 0,
            rows: vec![],
            error_code: 0,
            error_msg: String::new(),
        }
    }

    #[tokio::test]
    async fn single_contributor_sets_last_on_its_own_completion() {
        let (tx, mut rx) = mpsc::channel(16);
        let channel: Arc<dyn ChannelShared> = StreamChannelShared::new(tx, 1, 4);
        let task = Task::new(desc(), &channel);

        channel.transmit(&task, empty_result(), true).await.unwrap();
        let header_item = rx.recv().await.unwrap().unwrap();
        match header_item.body {
            Some(qserv_proto::stream_item::Body::Header(h)) => assert!(h.last),
            _ => panic!("expected header"),
        }
    }

    #[tokio::test]
    async fn two_contributors_only_the_second_completion_sets_last() {
        let (tx, mut rx) = mpsc::channel(16);
        let channel: Arc<dyn ChannelShared> = StreamChannelShared::new(tx, 2, 4);
        let task_a = Task::new(desc(), &channel);
        let task_b = Task::new(desc(), &channel);

        channel.transmit(&task_a, empty_result(), true).await.unwrap();
        let header_a = rx.recv().await.unwrap().unwrap();
        match header_a.body {
            Some(qserv_proto::stream_item::Body::Header(h)) => assert!(!h.last),
            _ => panic!("expected header"),
        }
        let _ = rx.recv().await.unwrap().unwrap(); // data item for task_a

        channel.transmit(&task_b, empty_result(), true).await.unwrap();
        let header_b = rx.recv().await.unwrap().unwrap();
        match header_b.body {
            Some(qserv_proto::stream_item::Body::Header(h)) => assert!(h.last),
            _ => panic!("expected header"),
        }
    }
}
