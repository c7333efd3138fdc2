//! Error taxonomy from spec.md section 7 ("Error handling design").
//!
//! Each variant below is one row of that section's table. `is_retryable`
//! centralizes the retry policy so `JobQuery::attemptFailed` (spec.md
//! section 4.4) never has to re-derive it per call site.

use displaydoc::Display;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DispatchError>;

/// All failures the dispatch/merge core can report, tagged with their
/// recovery policy.
#[derive(Debug, Display, Error, Clone)]
pub enum DispatchError {
    /// transport error talking to worker: {0}
    Transport(String),

    /// request timed out after {0:?}
    Timeout(std::time::Duration),

    /// worker reported resource exhaustion or a duplicate in-flight request: {0}
    WorkerBusy(String),

    /// worker reported a SQL/schema error: {0}
    WorkerSql(String),

    /// merger SQL error: {0}
    MergeSql(String),

    /// merge table byte cap exceeded ({used} > {limit} bytes)
    MergeSizeExceeded { used: u64, limit: u64 },

    /// query was cancelled
    Cancelled,

    /// attempt limit ({0}) reached for this job
    AttemptLimitReached(u32),

    /// protocol invariant violated: {0}
    InvariantViolation(String),
}

impl DispatchError {
    /// Whether `JobQuery` should retry the job after this failure (spec.md
    /// section 4.4, "Retry rules").
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::Transport(_) | DispatchError::Timeout(_) | DispatchError::WorkerBusy(_)
        )
    }
}
