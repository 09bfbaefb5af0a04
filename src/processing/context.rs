//! Execution context handed to handlers and middleware.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

use crate::core::Job;

/// Context information provided to handlers during job execution
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Id of the job being executed
    pub job_id: String,
    /// Type tag of the job
    pub type_tag: String,
    /// Queue the job was reserved from
    pub queue: String,
    /// 1-based execution number (1 on the first run, 2 on the first retry, ...)
    pub attempt: u32,
    /// Retry budget of the job
    pub max_attempts: u32,
    /// Worker executing the job
    pub worker_id: String,
    /// When the execution started
    pub started_at: DateTime<Utc>,
    /// Message of the previous failure, if this is a retry
    pub previous_error: Option<String>,
    /// Values injected by middleware
    pub metadata: HashMap<String, String>,
}

impl JobContext {
    /// Build the context for executing `job` on `worker_id`.
    pub fn for_job(job: &Job, worker_id: impl Into<String>) -> Self {
        Self {
            job_id: job.id.clone(),
            type_tag: job.type_tag.clone(),
            queue: job.queue.clone(),
            attempt: job.attempts + 1,
            max_attempts: job.max_attempts,
            worker_id: worker_id.into(),
            started_at: Utc::now(),
            previous_error: job.last_error.clone(),
            metadata: job.metadata.clone(),
        }
    }

    /// Add execution metadata
    pub fn add_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// Look up execution metadata
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Get execution duration so far
    pub fn elapsed(&self) -> Duration {
        Utc::now() - self.started_at
    }

    /// Check if this is a retry attempt
    pub fn is_retry(&self) -> bool {
        self.attempt > 1
    }
}
