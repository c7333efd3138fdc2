//! Result-processing (czar) subsystem: spec.md section 4.7, `InfileMerger`.

pub mod infile_merger;
pub mod sink;

pub use infile_merger::{InfileMerger, InfileMergerConfig, MergeOutcome};
pub use sink::{InMemoryMergeSink, MergeSink, MySqlMergeSink};
