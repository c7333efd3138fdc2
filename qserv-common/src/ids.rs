//! Identity types from spec.md section 3 ("Data model").

use std::fmt;

/// Czar-assigned 64-bit query identifier, unique for the lifetime of the czar.
pub type QueryId = u64;

/// Dense small integer, unique within one `UserQuery`.
pub type JobId = i32;

/// Monotonically increasing per-`(queryId, jobId)` retry counter.
pub type AttemptCount = u32;

/// Spherical-partition chunk identifier.
pub type ChunkId = i32;

/// `jobIdAttempt = jobId * MAX_JOB_ATTEMPTS + attemptCount` (spec.md section
/// 4.7), the column every merged row is tagged with so rows from a
/// superseded attempt can be scrubbed with a single `DELETE ... WHERE
/// jobIdAttempt IN (...)`.
pub fn job_id_attempt(job_id: JobId, attempt_count: AttemptCount, max_attempts: u32) -> i64 {
    job_id as i64 * max_attempts as i64 + attempt_count as i64
}

/// `(queryId, jobId)` pair used as an Executive-wide job key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobKey {
    pub query_id: QueryId,
    pub job_id: JobId,
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.query_id, self.job_id)
    }
}

/// Formats a human-readable "for logging" id string, mirroring the debug
/// helper Qserv calls `QueryIdHelper::makeIdStr`.
pub fn id_str(query_id: QueryId, job_id: JobId) -> String {
    format!("QID={query_id} JID={job_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_attempt_is_dense_and_ordered() {
        assert_eq!(job_id_attempt(0, 0, 5), 0);
        assert_eq!(job_id_attempt(0, 1, 5), 1);
        assert_eq!(job_id_attempt(1, 0, 5), 5);
        assert_eq!(job_id_attempt(1, 4, 5), 9);
    }
}
