//! Operator access to dead-lettered jobs.

use std::sync::Arc;
use tracing::{info, warn};

use crate::core::DeadLetterEntry;
use crate::error::{QueueError, Result};
use crate::metrics::QueueMetrics;
use crate::storage::{PushOutcome, StorageDriver};

/// Dead-letter queue of one driver.
///
/// Entries are owned by the driver; this type only adds the operator actions
/// on top: inspect, retry as a fresh job, or purge.
#[derive(Clone)]
pub struct DeadLetterQueue {
    driver: Arc<dyn StorageDriver>,
    metrics: Option<Arc<QueueMetrics>>,
}

impl DeadLetterQueue {
    /// Create a DLQ view over `driver`
    pub fn new(driver: Arc<dyn StorageDriver>) -> Self {
        Self {
            driver,
            metrics: None,
        }
    }

    /// Count retried jobs as dispatches in `metrics`
    pub fn with_metrics(mut self, metrics: Arc<QueueMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Store an entry directly
    pub async fn add(&self, entry: DeadLetterEntry) -> Result<()> {
        self.driver.add_dead(entry).await?;
        Ok(())
    }

    /// Entries for `queue`, or every queue when `None`, oldest failure first
    pub async fn list(&self, queue: Option<&str>) -> Result<Vec<DeadLetterEntry>> {
        Ok(self.driver.list_dead(queue).await?)
    }

    /// Look up one entry
    pub async fn get(&self, job_id: &str) -> Result<Option<DeadLetterEntry>> {
        Ok(self.driver.get_dead(job_id).await?)
    }

    /// Re-enqueue a dead job as a brand new job (new id, zero attempts,
    /// available now) and remove the entry. Returns the new job id.
    ///
    /// If the push fails the entry is restored.
    pub async fn retry(&self, job_id: &str) -> Result<String> {
        let entry = self
            .driver
            .remove_dead(job_id)
            .await?
            .ok_or_else(|| QueueError::JobNotFound {
                job_id: job_id.to_string(),
            })?;

        let job = entry.job.fresh_copy();
        let new_id = job.id.clone();
        let queue = job.queue.clone();

        match self.driver.push(job).await {
            Ok(PushOutcome::Queued) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_dispatched(&queue);
                }
                info!(
                    dead_job_id = %job_id,
                    job_id = %new_id,
                    queue = %queue,
                    "Retried dead-letter entry"
                );
                Ok(new_id)
            }
            Ok(PushOutcome::Executed(result)) => {
                // Synchronous drivers never hold entries, so this is only reachable
                // through a custom driver
                result.map_err(|failure| QueueError::HandlerFailed {
                    job_id: new_id.clone(),
                    message: failure.to_string(),
                })?;
                Ok(new_id)
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Retry failed; restoring dead-letter entry");
                self.driver.add_dead(entry).await?;
                Err(e.into())
            }
        }
    }

    /// Permanently delete one entry. Returns whether it existed.
    pub async fn purge(&self, job_id: &str) -> Result<bool> {
        Ok(self.driver.remove_dead(job_id).await?.is_some())
    }

    /// Permanently delete every entry of `queue`. Returns how many.
    pub async fn purge_queue(&self, queue: &str) -> Result<usize> {
        let entries = self.driver.list_dead(Some(queue)).await?;
        let mut purged = 0;
        for entry in entries {
            if self.driver.remove_dead(entry.id()).await?.is_some() {
                purged += 1;
            }
        }
        info!(queue = %queue, purged, "Purged dead-letter queue");
        Ok(purged)
    }

    /// Number of entries for `queue`
    pub async fn count(&self, queue: &str) -> Result<usize> {
        Ok(self.driver.stats(queue).await?.dead_letter_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Job;
    use crate::storage::MemoryDriver;
    use serde_json::json;
    use std::time::Duration;

    async fn dead_job(driver: &Arc<dyn StorageDriver>, queue: &str) -> Job {
        let job = Job::new("report", json!({"month": 4})).on_queue(queue);
        driver.push(job).await.unwrap();
        let mut job = driver
            .reserve(queue, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        job.attempts = 4;
        driver.move_to_dlq(&job, "exhausted").await.unwrap();
        job
    }

    #[tokio::test]
    async fn test_retry_creates_fresh_job() {
        let driver: Arc<dyn StorageDriver> = Arc::new(MemoryDriver::new());
        let dlq = DeadLetterQueue::new(driver.clone());
        let dead = dead_job(&driver, "default").await;

        let new_id = dlq.retry(&dead.id).await.unwrap();
        assert_ne!(new_id, dead.id);
        assert!(dlq.get(&dead.id).await.unwrap().is_none());

        let job = driver.get(&new_id).await.unwrap().unwrap();
        assert_eq!(job.attempts, 0);
        assert_eq!(job.payload, dead.payload);
        assert!(job.last_error.is_none());
        assert_eq!(driver.stats("default").await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_retry_unknown_id() {
        let dlq = DeadLetterQueue::new(Arc::new(MemoryDriver::new()));
        assert!(matches!(
            dlq.retry("missing").await,
            Err(QueueError::JobNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_purge_and_purge_queue() {
        let driver: Arc<dyn StorageDriver> = Arc::new(MemoryDriver::new());
        let dlq = DeadLetterQueue::new(driver.clone());
        let first = dead_job(&driver, "default").await;
        dead_job(&driver, "default").await;
        dead_job(&driver, "mail").await;

        assert!(dlq.purge(&first.id).await.unwrap());
        assert!(!dlq.purge(&first.id).await.unwrap());
        assert_eq!(dlq.count("default").await.unwrap(), 1);

        assert_eq!(dlq.purge_queue("default").await.unwrap(), 1);
        assert!(dlq.list(Some("default")).await.unwrap().is_empty());
        assert_eq!(dlq.list(None).await.unwrap().len(), 1);
    }
}
