//! Inline execution driver.
//!
//! `push` runs the job through the middleware pipeline and its handler on the
//! caller's task and stores nothing. There is no retry, no dead-letter
//! persistence and no delay: a dispatch with a delay executes immediately, and
//! a failing handler surfaces as the dispatch result. Meant for local
//! development and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{DriverStats, PushOutcome, StorageDriver, StorageError};
use crate::core::{DeadLetterEntry, Job};
use crate::processing::JobExecutor;

/// Worker id reported to handlers run by the synchronous driver
pub const SYNC_WORKER_ID: &str = "sync";

/// Driver that executes jobs at dispatch time
#[derive(Debug, Clone)]
pub struct SyncDriver {
    executor: Arc<JobExecutor>,
}

impl SyncDriver {
    /// Create a synchronous driver running jobs with `executor`
    pub fn new(executor: Arc<JobExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl StorageDriver for SyncDriver {
    fn name(&self) -> &str {
        "sync"
    }

    async fn push(&self, job: Job) -> Result<PushOutcome, StorageError> {
        if job.available_at > Utc::now() {
            debug!(job_id = %job.id, "Sync driver ignores delay; executing now");
        }

        let result = self.executor.execute(&job, SYNC_WORKER_ID, None).await;
        Ok(PushOutcome::Executed(result))
    }

    async fn reserve(
        &self,
        _queue: &str,
        _visibility_timeout: Duration,
    ) -> Result<Option<Job>, StorageError> {
        Ok(None)
    }

    async fn ack(&self, _job: &Job) -> Result<(), StorageError> {
        Ok(())
    }

    async fn release(
        &self,
        _job: &Job,
        _available_at: DateTime<Utc>,
        _last_error: Option<&str>,
    ) -> Result<(), StorageError> {
        Ok(())
    }

    async fn move_to_dlq(
        &self,
        job: &Job,
        reason: &str,
    ) -> Result<DeadLetterEntry, StorageError> {
        Ok(DeadLetterEntry::new(job, reason))
    }

    async fn get(&self, _job_id: &str) -> Result<Option<Job>, StorageError> {
        Ok(None)
    }

    async fn stats(&self, _queue: &str) -> Result<DriverStats, StorageError> {
        Ok(DriverStats::default())
    }

    async fn clear(&self, _queue: &str) -> Result<usize, StorageError> {
        Ok(0)
    }

    async fn add_dead(&self, _entry: DeadLetterEntry) -> Result<(), StorageError> {
        Ok(())
    }

    async fn list_dead(&self, _queue: Option<&str>) -> Result<Vec<DeadLetterEntry>, StorageError> {
        Ok(Vec::new())
    }

    async fn get_dead(&self, _job_id: &str) -> Result<Option<DeadLetterEntry>, StorageError> {
        Ok(None)
    }

    async fn remove_dead(&self, _job_id: &str) -> Result<Option<DeadLetterEntry>, StorageError> {
        Ok(None)
    }
}
