//! Dispatch-side (czar) subsystem: spec.md section 4, modules `QdispPool`,
//! `PseudoFifo`, `Executive`, `JobQuery`, `QueryRequest`.

pub mod executive;
pub mod job_query;
pub mod pseudo_fifo;
pub mod qdisp_pool;
pub mod query_request;

pub use executive::{Executive, ExecutiveConfig, QueryState};
pub use job_query::{JobDescription, JobQuery};
pub use pseudo_fifo::PseudoFifo;
pub use qdisp_pool::QdispPool;
pub use query_request::QueryRequest;
