use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

use super::{
    DriverStats, MemoryConfig, PushOutcome, StorageDriver, StorageError, ensure_held,
    reservation_deadline,
};
use crate::core::{DeadLetterEntry, Job};

#[derive(Debug, Default)]
struct MemoryState {
    jobs: HashMap<String, Job>,
    dead: HashMap<String, DeadLetterEntry>,
    next_sequence: u64,
}

impl MemoryState {
    /// The stored record of `job`, if `job` still holds its reservation.
    fn held(&mut self, job: &Job, now: DateTime<Utc>) -> Result<&mut Job, StorageError> {
        let stored = self
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| StorageError::job_not_found(&job.id))?;
        ensure_held(stored, job, now)?;
        Ok(stored)
    }
}

/// In-memory driver
///
/// Keeps every job in a `HashMap` behind a single mutex, so the
/// select-then-mark sequence inside [`reserve`](StorageDriver::reserve) is
/// atomic across workers sharing the instance. Nothing survives a restart;
/// intended for development, tests and single-process deployments.
#[derive(Debug)]
pub struct MemoryDriver {
    state: Mutex<MemoryState>,
    config: MemoryConfig,
}

impl MemoryDriver {
    /// Create a new memory driver with default configuration
    pub fn new() -> Self {
        Self::with_config(MemoryConfig::default())
    }

    /// Create a new memory driver with the specified configuration
    pub fn with_config(config: MemoryConfig) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            config,
        }
    }

    /// Get the number of pending and reserved jobs across all queues
    pub fn len(&self) -> usize {
        self.lock("len").map(|state| state.jobs.len()).unwrap_or(0)
    }

    /// Check if the driver holds no pending or reserved jobs
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self, operation: &str) -> Result<MutexGuard<'_, MemoryState>, StorageError> {
        self.state
            .lock()
            .map_err(|_| StorageError::poisoned(operation))
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageDriver for MemoryDriver {
    fn name(&self) -> &str {
        "memory"
    }

    async fn push(&self, mut job: Job) -> Result<PushOutcome, StorageError> {
        let mut state = self.lock("push")?;

        if let Some(max_jobs) = self.config.max_jobs {
            if state.jobs.len() >= max_jobs {
                return Err(StorageError::capacity_exceeded(format!(
                    "Memory driver is at capacity ({} jobs)",
                    state.jobs.len()
                )));
            }
        }

        state.next_sequence += 1;
        job.sequence = state.next_sequence;
        job.clear_reservation();
        state.jobs.insert(job.id.clone(), job);

        Ok(PushOutcome::Queued)
    }

    async fn reserve(
        &self,
        queue: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<Job>, StorageError> {
        let now = Utc::now();
        let until = reservation_deadline(now, visibility_timeout)?;
        let mut state = self.lock("reserve")?;

        let best_id = state
            .jobs
            .values()
            .filter(|job| job.queue == queue && job.is_eligible(now))
            .min_by(|a, b| a.reservation_order(b))
            .map(|job| job.id.clone());

        let Some(id) = best_id else {
            return Ok(None);
        };

        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };
        if job.reservation_expired(now) {
            debug!(job_id = %job.id, "Reclaiming expired reservation");
        }
        job.mark_reserved(until)
            .map_err(|e| StorageError::operation_failed("reserve", e.to_string()))?;

        Ok(Some(job.clone()))
    }

    async fn ack(&self, job: &Job) -> Result<(), StorageError> {
        let now = Utc::now();
        let mut state = self.lock("ack")?;
        state.held(job, now)?;
        state.jobs.remove(&job.id);
        Ok(())
    }

    async fn release(
        &self,
        job: &Job,
        available_at: DateTime<Utc>,
        last_error: Option<&str>,
    ) -> Result<(), StorageError> {
        let now = Utc::now();
        let mut state = self.lock("release")?;
        let stored = state.held(job, now)?;

        stored
            .mark_released(available_at)
            .map_err(|e| StorageError::operation_failed("release", e.to_string()))?;
        if let Some(error) = last_error {
            stored.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn move_to_dlq(
        &self,
        job: &Job,
        reason: &str,
    ) -> Result<DeadLetterEntry, StorageError> {
        let now = Utc::now();
        let mut state = self.lock("move_to_dlq")?;
        state.held(job, now)?;
        state.jobs.remove(&job.id);

        let entry = DeadLetterEntry::new(job, reason);
        state.dead.insert(job.id.clone(), entry.clone());
        Ok(entry)
    }

    async fn get(&self, job_id: &str) -> Result<Option<Job>, StorageError> {
        let state = self.lock("get")?;
        Ok(state.jobs.get(job_id).cloned())
    }

    async fn stats(&self, queue: &str) -> Result<DriverStats, StorageError> {
        let now = Utc::now();
        let state = self.lock("stats")?;
        let mut stats = DriverStats::default();

        for job in state.jobs.values().filter(|job| job.queue == queue) {
            if job.is_reserved_at(now) {
                stats.reserved += 1;
            } else {
                stats.pending += 1;
            }
        }
        stats.dead_letter_count = state
            .dead
            .values()
            .filter(|entry| entry.queue() == queue)
            .count();

        Ok(stats)
    }

    async fn clear(&self, queue: &str) -> Result<usize, StorageError> {
        let mut state = self.lock("clear")?;
        let before = state.jobs.len();
        state.jobs.retain(|_, job| job.queue != queue);
        Ok(before - state.jobs.len())
    }

    async fn add_dead(&self, entry: DeadLetterEntry) -> Result<(), StorageError> {
        let mut state = self.lock("add_dead")?;
        state.dead.insert(entry.id().to_string(), entry);
        Ok(())
    }

    async fn list_dead(&self, queue: Option<&str>) -> Result<Vec<DeadLetterEntry>, StorageError> {
        let state = self.lock("list_dead")?;
        let mut entries: Vec<DeadLetterEntry> = state
            .dead
            .values()
            .filter(|entry| queue.is_none_or(|q| entry.queue() == q))
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.failed_at.cmp(&b.failed_at));
        Ok(entries)
    }

    async fn get_dead(&self, job_id: &str) -> Result<Option<DeadLetterEntry>, StorageError> {
        let state = self.lock("get_dead")?;
        Ok(state.dead.get(job_id).cloned())
    }

    async fn remove_dead(&self, job_id: &str) -> Result<Option<DeadLetterEntry>, StorageError> {
        let mut state = self.lock("remove_dead")?;
        Ok(state.dead.remove(job_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::JobStatus;
    use serde_json::json;

    const VISIBILITY: Duration = Duration::from_secs(30);

    fn job(queue: &str) -> Job {
        Job::new("test_job", json!({"n": 1})).on_queue(queue)
    }

    #[tokio::test]
    async fn test_memory_driver_basic_cycle() {
        let driver = MemoryDriver::new();
        let job = job("default");

        assert_eq!(driver.push(job.clone()).await.unwrap(), PushOutcome::Queued);
        assert_eq!(driver.len(), 1);

        let reserved = driver.reserve("default", VISIBILITY).await.unwrap().unwrap();
        assert_eq!(reserved.id, job.id);
        assert_eq!(reserved.status, JobStatus::Reserved);
        assert!(reserved.reserved_until.is_some());

        // A reserved job is hidden from other callers
        assert!(driver.reserve("default", VISIBILITY).await.unwrap().is_none());

        driver.ack(&reserved).await.unwrap();
        assert!(driver.is_empty());
        assert!(driver.get(&job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_driver_queues_are_isolated() {
        let driver = MemoryDriver::new();
        driver.push(job("mail")).await.unwrap();

        assert!(driver.reserve("default", VISIBILITY).await.unwrap().is_none());
        assert!(driver.reserve("mail", VISIBILITY).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_memory_driver_priority_before_enqueue_order() {
        let driver = MemoryDriver::new();
        let low = job("default").with_priority(1);
        let high = job("default").with_priority(5);
        driver.push(low.clone()).await.unwrap();
        driver.push(high.clone()).await.unwrap();

        let first = driver.reserve("default", VISIBILITY).await.unwrap().unwrap();
        let second = driver.reserve("default", VISIBILITY).await.unwrap().unwrap();
        assert_eq!(first.id, high.id);
        assert_eq!(second.id, low.id);
    }

    #[tokio::test]
    async fn test_memory_driver_respects_available_at() {
        let driver = MemoryDriver::new();
        let mut delayed = job("default");
        delayed.available_at = Utc::now() + chrono::Duration::seconds(60);
        driver.push(delayed).await.unwrap();

        assert!(driver.reserve("default", VISIBILITY).await.unwrap().is_none());
        let stats = driver.stats("default").await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.reserved, 0);
    }

    #[tokio::test]
    async fn test_memory_driver_release_increments_attempts() {
        let driver = MemoryDriver::new();
        let job = job("default");
        driver.push(job.clone()).await.unwrap();
        let reserved = driver.reserve("default", VISIBILITY).await.unwrap().unwrap();

        driver
            .release(&reserved, Utc::now(), Some("boom"))
            .await
            .unwrap();

        let stored = driver.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.last_error.as_deref(), Some("boom"));
        assert!(driver.reserve("default", VISIBILITY).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_memory_driver_expired_reservation_is_reclaimed() {
        let driver = MemoryDriver::new();
        let job = job("default");
        driver.push(job.clone()).await.unwrap();

        let first = driver
            .reserve("default", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(driver.stats("default").await.unwrap().pending, 1);

        let second = driver.reserve("default", VISIBILITY).await.unwrap().unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(driver.stats("default").await.unwrap().reserved, 1);
    }

    #[tokio::test]
    async fn test_memory_driver_dead_letter_cycle() {
        let driver = MemoryDriver::new();
        let job = job("default");
        driver.push(job.clone()).await.unwrap();
        let mut reserved = driver.reserve("default", VISIBILITY).await.unwrap().unwrap();

        reserved.attempts = 3;
        let entry = driver.move_to_dlq(&reserved, "gave up").await.unwrap();
        assert_eq!(entry.attempts_made, 3);
        assert_eq!(entry.job.status, JobStatus::Dead);

        let stats = driver.stats("default").await.unwrap();
        assert_eq!(stats.pending + stats.reserved, 0);
        assert_eq!(stats.dead_letter_count, 1);

        assert_eq!(driver.list_dead(Some("default")).await.unwrap().len(), 1);
        assert!(driver.list_dead(Some("other")).await.unwrap().is_empty());
        assert!(driver.get_dead(&job.id).await.unwrap().is_some());
        assert!(driver.remove_dead(&job.id).await.unwrap().is_some());
        assert!(driver.get_dead(&job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_driver_capacity_limit() {
        let driver = MemoryDriver::with_config(MemoryConfig::new().with_max_jobs(2));

        driver.push(job("default")).await.unwrap();
        driver.push(job("default")).await.unwrap();

        let result = driver.push(job("default")).await;
        assert!(matches!(
            result,
            Err(StorageError::CapacityExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn test_memory_driver_missing_job() {
        let driver = MemoryDriver::new();
        let missing = job("default");

        assert!(matches!(
            driver.ack(&missing).await,
            Err(StorageError::JobNotFound { .. })
        ));
        assert!(matches!(
            driver.release(&missing, Utc::now(), None).await,
            Err(StorageError::JobNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_memory_driver_stale_holder_cannot_release() {
        let driver = MemoryDriver::new();
        driver.push(job("default")).await.unwrap();

        let stale = driver
            .reserve("default", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let current = driver
            .reserve("default", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stale.id, current.id);

        assert!(matches!(
            driver.release(&stale, Utc::now(), Some("late")).await,
            Err(StorageError::ReservationLost { .. })
        ));
        assert!(driver.reserve("default", VISIBILITY).await.unwrap().is_none());

        let stored = driver.get(&current.id).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 0);
        assert!(stored.last_error.is_none());
    }

    #[tokio::test]
    async fn test_memory_driver_stale_holder_cannot_ack_or_dead_letter() {
        let driver = MemoryDriver::new();
        driver.push(job("default")).await.unwrap();

        let stale = driver
            .reserve("default", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let current = driver
            .reserve("default", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        assert!(matches!(
            driver.ack(&stale).await,
            Err(StorageError::ReservationLost { .. })
        ));
        assert!(matches!(
            driver.move_to_dlq(&stale, "late").await,
            Err(StorageError::ReservationLost { .. })
        ));
        assert_eq!(driver.stats("default").await.unwrap().dead_letter_count, 0);

        driver.ack(&current).await.unwrap();
        assert!(driver.is_empty());
    }

    #[tokio::test]
    async fn test_memory_driver_expired_holder_is_rejected() {
        let driver = MemoryDriver::new();
        driver.push(job("default")).await.unwrap();

        let reserved = driver
            .reserve("default", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            driver.ack(&reserved).await,
            Err(StorageError::ReservationLost { .. })
        ));
        assert_eq!(driver.len(), 1);
    }

    #[tokio::test]
    async fn test_memory_driver_clear() {
        let driver = MemoryDriver::new();
        driver.push(job("default")).await.unwrap();
        driver.push(job("default")).await.unwrap();
        driver.push(job("mail")).await.unwrap();

        assert_eq!(driver.clear("default").await.unwrap(), 2);
        assert_eq!(driver.len(), 1);
    }
}
