//! The streaming RPC transport contract from spec.md section 2: "A
//! bidirectional streaming RPC with out-of-band metadata; delivers a sized
//! header + arbitrary payload stream per request and signals completion or
//! failure." spec.md section 1 treats the transport's internals as an
//! external collaborator; this module defines only the contract
//! `QueryRequest` needs from it, plus a `tonic`-backed implementation and a
//! fake used by tests.

pub mod fake;
pub mod tonic_transport;

use futures::stream::BoxStream;
use qserv_proto::{ProtoHeader, Request, Result as WireResult};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("connection to worker failed: {0}")]
    Connect(String),
    #[error("stream ended unexpectedly")]
    UnexpectedEnd,
    #[error("worker returned an RPC-level error: {0}")]
    Rpc(String),
    #[error("request was cancelled")]
    Cancelled,
}

/// One item of a dispatch response stream: either the header announcing the
/// next payload's size, or the payload itself (spec.md section 3,
/// "Framing invariant"; section 4.5, "Header chaining protocol").
#[derive(Debug, Clone)]
pub enum ResponseItem {
    Header(ProtoHeader),
    Data(WireResult),
}

pub type ResponseStream = BoxStream<'static, std::result::Result<ResponseItem, TransportError>>;

/// What `QueryRequest` requires of the transport: dispatch one `Request` and
/// get back a stream of header/data items in wire order. Implementations
/// must preserve order (spec.md section 5: "Within one Job, headers and
/// data messages are delivered and merged in stream order").
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn dispatch(
        &self,
        worker_addr: &str,
        request: Request,
    ) -> std::result::Result<ResponseStream, TransportError>;

    /// Best-effort cancellation signal for an in-flight dispatch. Concrete
    /// transports key in-flight requests by `(query_id, job_id,
    /// attempt_count)`; a cancel for an already-finished or unknown request
    /// is a no-op (spec.md section 4.5: "cancel() is idempotent").
    async fn cancel(&self, query_id: u64, job_id: i32, attempt_count: u32);
}

pub type SharedTransport = std::sync::Arc<dyn Transport>;
