//! Dead-letter records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{Job, JobStatus};

/// Immutable snapshot of a job taken when it exhausted its retries.
///
/// Created once by a driver's `move_to_dlq`; removed only by an explicit
/// retry or purge through the [`DeadLetterQueue`](crate::DeadLetterQueue).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// The job as it was at the moment of exhaustion
    pub job: Job,
    /// Message of the last failure
    pub failure_reason: String,
    /// When the job was dead-lettered
    pub failed_at: DateTime<Utc>,
    /// Executions made before giving up
    pub attempts_made: u32,
}

impl DeadLetterEntry {
    /// Snapshots `job` as dead.
    pub fn new(job: &Job, failure_reason: impl Into<String>) -> Self {
        let failure_reason = failure_reason.into();
        let mut job = job.clone();
        job.status = JobStatus::Dead;
        job.reserved_until = None;
        job.reservation_token = None;
        job.last_error = Some(failure_reason.clone());

        Self {
            attempts_made: job.attempts,
            job,
            failure_reason,
            failed_at: Utc::now(),
        }
    }

    /// Id of the dead job.
    pub fn id(&self) -> &str {
        &self.job.id
    }

    /// Queue the job was taken from.
    pub fn queue(&self) -> &str {
        &self.job.queue
    }
}
