//! Wire contract between the czar and the worker dispatch service.
//!
//! This crate owns exactly what spec.md section 6 calls the "wire protocol":
//! the protobuf message shapes and the fixed-size header envelope, plus the
//! `tonic`-generated client/server stubs for the `WorkerDispatch` service.
//! Everything else (the transport's actual I/O, retries, merging) lives in
//! `qserv-czar` and `qserv-worker`.

pub mod header;

tonic::include_proto!("qserv.dispatch");

pub use header::{ProtoHeaderWrap, HeaderError};

/// `protocol_version` below this is rejected outright (spec.md section 6: "protocol
/// version >= 2").
pub const MIN_PROTOCOL_VERSION: i32 = 2;

/// Default `MAX_JOB_ATTEMPTS` referenced throughout spec.md sections 3, 4.4, 8.
pub const DEFAULT_MAX_JOB_ATTEMPTS: u32 = 5;
