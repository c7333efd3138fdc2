//! The worker's `tonic` `WorkerDispatch` service: turns an incoming
//! `Request` into a `Task` routed through the `Foreman`/`BlendScheduler`, and
//! streams its results back (spec.md section 4.6, section 6 wire protocol).

use crate::channel_shared::{ChannelShared, StreamChannelShared, WireItem};
use crate::foreman::Foreman;
use crate::task::{QueryExecutor, Task, TaskDescription};
use qserv_proto::worker_dispatch_server::WorkerDispatch;
use qserv_proto::{Request, StreamItem, MIN_PROTOCOL_VERSION};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request as TonicRequest, Response, Status};

pub type ResultStream = ReceiverStream<WireItem>;

pub struct WorkerDispatchService {
    foreman: Arc<Foreman>,
    response_buffer: usize,
    transmit_concurrency: usize,
}

impl WorkerDispatchService {
    pub fn new(foreman: Arc<Foreman>, response_buffer: usize, transmit_concurrency: usize) -> Self {
        Self {
            foreman,
            response_buffer,
            transmit_concurrency,
        }
    }
}

#[tonic::async_trait]
impl WorkerDispatch for WorkerDispatchService {
    type ExecuteStream = ResultStream;

    async fn execute(&self, request: TonicRequest<Request>) -> Result<Response<Self::ExecuteStream>, Status> {
        let req = request.into_inner();
        if req.protocol_version < MIN_PROTOCOL_VERSION {
            return Err(Status::invalid_argument(format!(
                "protocol_version {} below minimum {MIN_PROTOCOL_VERSION}",
                req.protocol_version
            )));
        }

        let (tx, rx) = mpsc::channel::<WireItem>(self.response_buffer);
        let channel: Arc<dyn ChannelShared> = StreamChannelShared::new(tx, 1, self.transmit_concurrency);

        let sql = if req.subchunk_sql.is_empty() {
            req.fragment_sql.clone()
        } else {
            req.subchunk_sql.clone()
        };
        let desc = TaskDescription {
            query_id: req.query_id as u64,
            job_id: req.job_id,
            attempt_count: req.attempt_count as u32,
            chunk_id: req.chunk_id,
            fragment_index: 0,
            sql,
            priority: req.priority,
            interactive: req.interactive,
            scan_tables: req.scan_tables.clone(),
        };
        let task = Task::new(desc, &channel);
        self.foreman.queue_task(task);

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

/// Wires a `Foreman`'s dispatch loops and a `tonic` server together. Kept
/// separate from `main.rs` so integration tests can spin up a server on an
/// ephemeral port.
pub async fn serve(
    addr: std::net::SocketAddr,
    foreman: Arc<Foreman>,
    response_buffer: usize,
    transmit_concurrency: usize,
) -> anyhow::Result<()> {
    let _dispatch_loops = foreman.spawn_dispatch_loops();
    let service = WorkerDispatchService::new(foreman, response_buffer, transmit_concurrency);
    tonic::transport::Server::builder()
        .add_service(qserv_proto::worker_dispatch_server::WorkerDispatchServer::new(service))
        .serve(addr)
        .await?;
    Ok(())
}

/// No-op executor placeholder only used where a real `QueryExecutor` hasn't
/// been wired in yet; production deployments provide one backed by a real
/// MySQL connector (spec.md section 1, "MySQL connector wrapping ... are
/// external dependencies").
pub struct UnimplementedExecutor;

#[async_trait::async_trait]
impl QueryExecutor for UnimplementedExecutor {
    async fn execute(&self, _sql: &str) -> Result<crate::task::RowStream, qserv_common::error::DispatchError> {
        Err(qserv_common::error::DispatchError::InvariantViolation(
            "no QueryExecutor wired in".into(),
        ))
    }
}
