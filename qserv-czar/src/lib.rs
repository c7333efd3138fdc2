//! Czar-side dispatch/merge core (spec.md section 4): fans a `UserQuery` out
//! into per-chunk `JobQuery`s, streams worker responses through
//! `QueryRequest`, and merges them through `InfileMerger`.

pub mod admin;
pub mod qdisp;
pub mod rproc;
pub mod transport;

pub use qdisp::{Executive, ExecutiveConfig, JobDescription, JobQuery, PseudoFifo, QdispPool, QueryState};
pub use rproc::{InfileMerger, InfileMergerConfig, MergeOutcome};
pub use transport::{SharedTransport, Transport, TransportError};
