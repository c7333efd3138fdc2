//! `JobStatus`: per-job state machine recording the latest transition
//! (spec.md section 2, 3).

use parking_lot::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStateCode {
    Provisioned,
    Queued,
    RequestSent,
    ResponseReady,
    MergeInProgress,
    Complete,
    CancelledState,
    ResultError,
    RetryError,
}

impl JobStateCode {
    /// Monotone terminal states invariant (spec.md section 3): once one of
    /// these is reached, the state never goes back to an in-flight code.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStateCode::Complete | JobStateCode::CancelledState | JobStateCode::ResultError
        )
    }
}

#[derive(Debug, Clone)]
pub struct JobStatusSnapshot {
    pub code: JobStateCode,
    pub timestamp_millis: u128,
    pub worker_message: Option<String>,
}

#[derive(Debug)]
struct Inner {
    code: JobStateCode,
    timestamp_millis: u128,
    worker_message: Option<String>,
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

/// Thread-safe latest-transition recorder for one Job.
#[derive(Debug)]
pub struct JobStatus {
    inner: Mutex<Inner>,
}

impl JobStatus {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                code: JobStateCode::Provisioned,
                timestamp_millis: now_millis(),
                worker_message: None,
            }),
        }
    }

    /// Records a transition. Once a terminal code has been recorded, further
    /// updates are ignored — this is what makes the "Monotone terminal
    /// states" invariant (spec.md section 3) hold regardless of callback
    /// ordering races.
    pub fn update_info(&self, code: JobStateCode, worker_message: Option<String>) {
        let mut guard = self.inner.lock();
        if guard.code.is_terminal() {
            return;
        }
        guard.code = code;
        guard.timestamp_millis = now_millis();
        guard.worker_message = worker_message;
    }

    pub fn snapshot(&self) -> JobStatusSnapshot {
        let guard = self.inner.lock();
        JobStatusSnapshot {
            code: guard.code,
            timestamp_millis: guard.timestamp_millis,
            worker_message: guard.worker_message.clone(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.inner.lock().code.is_terminal()
    }
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_state_cannot_be_overwritten() {
        let status = JobStatus::new();
        status.update_info(JobStateCode::Complete, Some("done".into()));
        status.update_info(JobStateCode::ResultError, Some("late error".into()));
        let snap = status.snapshot();
        assert_eq!(snap.code, JobStateCode::Complete);
        assert_eq!(snap.worker_message.as_deref(), Some("done"));
    }

    #[test]
    fn in_flight_transitions_are_recorded() {
        let status = JobStatus::new();
        status.update_info(JobStateCode::RequestSent, None);
        assert_eq!(status.snapshot().code, JobStateCode::RequestSent);
        assert!(!status.is_terminal());
    }
}
