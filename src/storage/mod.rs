use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::core::{DeadLetterEntry, Job};
use crate::processing::{JobExecutor, JobResult};

pub mod config;
pub mod error;
pub mod file;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;
pub mod settings;
pub mod sync;

#[cfg(test)]
mod test_locking;

#[cfg(feature = "redis")]
pub use config::RedisConfig;
pub use config::{DriverConfig, FileConfig, MemoryConfig};
pub use error::StorageError;
pub use file::FileDriver;
pub use memory::MemoryDriver;
#[cfg(feature = "redis")]
pub use redis::RedisDriver;
pub use settings::QueueSettings;
pub use sync::SyncDriver;

/// `now + timeout` as a reservation deadline.
pub(crate) fn reservation_deadline(
    now: DateTime<Utc>,
    timeout: Duration,
) -> Result<DateTime<Utc>, StorageError> {
    chrono::Duration::from_std(timeout)
        .ok()
        .and_then(|timeout| now.checked_add_signed(timeout))
        .ok_or_else(|| {
            StorageError::configuration(format!("visibility timeout {:?} out of range", timeout))
        })
}

/// Fails unless `held` still owns the live reservation of `stored`.
pub(crate) fn ensure_held(
    stored: &Job,
    held: &Job,
    now: DateTime<Utc>,
) -> Result<(), StorageError> {
    if stored.is_held_by(held, now) {
        Ok(())
    } else {
        Err(StorageError::reservation_lost(&stored.id))
    }
}

/// What a driver did with a pushed job.
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    /// Stored and waiting for a worker
    Queued,
    /// Executed inline (synchronous driver); nothing was stored
    Executed(JobResult),
}

/// Per-queue counts reported by a driver.
///
/// A job whose reservation has expired counts as pending. Delayed jobs count
/// as pending before they become eligible.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverStats {
    pub pending: usize,
    pub reserved: usize,
    pub dead_letter_count: usize,
}

/// Persistence of pending, reserved and dead jobs.
///
/// Every method is individually atomic with respect to concurrent callers on
/// the same driver instance. No sequence of two calls is atomic.
///
/// ## Reservation and delivery
///
/// [`reserve`](Self::reserve) is the only synchronization point between
/// workers: two callers never receive the same job while its reservation is
/// live. Among eligible jobs the driver returns the highest `priority` first,
/// then the lowest `available_at`, then the lowest enqueue `sequence`.
///
/// A reservation that is neither acked nor released before `reserved_until`
/// is treated as a crashed worker and the job becomes eligible again. Delivery
/// is therefore **at-least-once**: a job can run twice if its worker dies
/// after the handler finished but before [`ack`](Self::ack).
///
/// Each reservation carries a fresh `reservation_token`. [`ack`](Self::ack),
/// [`release`](Self::release) and [`move_to_dlq`](Self::move_to_dlq) take the
/// job as returned by `reserve` and fail with
/// [`StorageError::ReservationLost`] once that reservation has expired or the
/// job was handed to another worker.
///
/// ```text
/// Worker A ──┐
///            ├── reserve("default") ──→ Job #123
/// Worker B ──┘                       ──→ None (or Job #124)
/// ```
///
/// ## Examples
///
/// ```rust
/// use jobwell::storage::{MemoryDriver, StorageDriver};
/// use jobwell::Job;
/// use std::time::Duration;
///
/// # tokio_test::block_on(async {
/// let driver = MemoryDriver::new();
///
/// let job = Job::new("send_email", serde_json::json!({"to": "a@example.com"}));
/// driver.push(job.clone()).await.unwrap();
///
/// let reserved = driver
///     .reserve("default", Duration::from_secs(30))
///     .await
///     .unwrap()
///     .unwrap();
/// assert_eq!(reserved.id, job.id);
///
/// driver.ack(&reserved).await.unwrap();
/// assert_eq!(driver.stats("default").await.unwrap().pending, 0);
/// # });
/// ```
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Short driver name used in stats and logs
    fn name(&self) -> &str;

    /// Store a new job as pending.
    ///
    /// The caller has already set `available_at`. Drivers assign `sequence`.
    async fn push(&self, job: Job) -> Result<PushOutcome, StorageError>;

    /// Atomically claim the best eligible job on `queue`.
    ///
    /// Marks it reserved with `reserved_until = now + visibility_timeout` and
    /// returns it. Returns `None` immediately when nothing is eligible.
    async fn reserve(
        &self,
        queue: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<Job>, StorageError>;

    /// Permanently remove a reserved job after success.
    async fn ack(&self, job: &Job) -> Result<(), StorageError>;

    /// Return a reserved job to pending for another attempt.
    ///
    /// Increments `attempts`, records `last_error` and moves `available_at`
    /// forward to `available_at` (never backwards).
    async fn release(
        &self,
        job: &Job,
        available_at: DateTime<Utc>,
        last_error: Option<&str>,
    ) -> Result<(), StorageError>;

    /// Remove a reserved `job` from the main queue and store it as a
    /// dead-letter entry.
    ///
    /// The entry snapshots `job` as given, so callers pass the record with its
    /// final attempt count.
    async fn move_to_dlq(&self, job: &Job, reason: &str)
    -> Result<DeadLetterEntry, StorageError>;

    /// Look up a pending or reserved job.
    async fn get(&self, job_id: &str) -> Result<Option<Job>, StorageError>;

    /// Counts for `queue`.
    async fn stats(&self, queue: &str) -> Result<DriverStats, StorageError>;

    /// Drop every pending and reserved job on `queue`; returns how many.
    async fn clear(&self, queue: &str) -> Result<usize, StorageError>;

    /// Store a dead-letter entry directly.
    async fn add_dead(&self, entry: DeadLetterEntry) -> Result<(), StorageError>;

    /// Dead-letter entries, optionally for one queue, oldest failure first.
    async fn list_dead(&self, queue: Option<&str>) -> Result<Vec<DeadLetterEntry>, StorageError>;

    /// Look up a dead-letter entry by job id.
    async fn get_dead(&self, job_id: &str) -> Result<Option<DeadLetterEntry>, StorageError>;

    /// Remove and return a dead-letter entry.
    async fn remove_dead(&self, job_id: &str) -> Result<Option<DeadLetterEntry>, StorageError>;
}

/// Driver instance that can hold any driver implementation
pub enum DriverInstance {
    /// In-process memory driver
    Memory(MemoryDriver),
    /// JSON Lines file driver
    File(FileDriver),
    /// Inline execution driver
    Sync(SyncDriver),
    /// Redis driver
    #[cfg(feature = "redis")]
    Redis(RedisDriver),
}

impl DriverInstance {
    /// Create a driver instance from configuration.
    ///
    /// `executor` is only used by the synchronous driver, which runs jobs
    /// inline instead of storing them.
    ///
    /// ```rust
    /// use jobwell::storage::{DriverConfig, DriverInstance, MemoryConfig, StorageDriver};
    /// use jobwell::processing::{JobExecutor, JobRegistry};
    /// use std::sync::Arc;
    ///
    /// # tokio_test::block_on(async {
    /// let executor = Arc::new(JobExecutor::new(Arc::new(JobRegistry::new())));
    /// let config = DriverConfig::Memory(MemoryConfig::default());
    /// let driver = DriverInstance::from_config(config, executor).await.unwrap();
    /// assert_eq!(driver.name(), "memory");
    /// # });
    /// ```
    pub async fn from_config(
        config: DriverConfig,
        executor: Arc<JobExecutor>,
    ) -> Result<Self, StorageError> {
        match config {
            DriverConfig::Memory(memory_config) => Ok(DriverInstance::Memory(
                MemoryDriver::with_config(memory_config),
            )),
            DriverConfig::File(file_config) => {
                Ok(DriverInstance::File(FileDriver::open(file_config).await?))
            }
            DriverConfig::Sync => Ok(DriverInstance::Sync(SyncDriver::new(executor))),
            #[cfg(feature = "redis")]
            DriverConfig::Redis(redis_config) => Ok(DriverInstance::Redis(
                RedisDriver::with_config(redis_config).await?,
            )),
        }
    }

    /// Create a memory driver with default configuration
    pub fn memory() -> Self {
        DriverInstance::Memory(MemoryDriver::new())
    }

    /// Unwrap into a shareable trait object
    pub fn into_shared(self) -> Arc<dyn StorageDriver> {
        match self {
            DriverInstance::Memory(driver) => Arc::new(driver),
            DriverInstance::File(driver) => Arc::new(driver),
            DriverInstance::Sync(driver) => Arc::new(driver),
            #[cfg(feature = "redis")]
            DriverInstance::Redis(driver) => Arc::new(driver),
        }
    }

    fn inner(&self) -> &dyn StorageDriver {
        match self {
            DriverInstance::Memory(driver) => driver,
            DriverInstance::File(driver) => driver,
            DriverInstance::Sync(driver) => driver,
            #[cfg(feature = "redis")]
            DriverInstance::Redis(driver) => driver,
        }
    }
}

#[async_trait]
impl StorageDriver for DriverInstance {
    fn name(&self) -> &str {
        self.inner().name()
    }

    async fn push(&self, job: Job) -> Result<PushOutcome, StorageError> {
        self.inner().push(job).await
    }

    async fn reserve(
        &self,
        queue: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<Job>, StorageError> {
        self.inner().reserve(queue, visibility_timeout).await
    }

    async fn ack(&self, job: &Job) -> Result<(), StorageError> {
        self.inner().ack(job).await
    }

    async fn release(
        &self,
        job: &Job,
        available_at: DateTime<Utc>,
        last_error: Option<&str>,
    ) -> Result<(), StorageError> {
        self.inner().release(job, available_at, last_error).await
    }

    async fn move_to_dlq(
        &self,
        job: &Job,
        reason: &str,
    ) -> Result<DeadLetterEntry, StorageError> {
        self.inner().move_to_dlq(job, reason).await
    }

    async fn get(&self, job_id: &str) -> Result<Option<Job>, StorageError> {
        self.inner().get(job_id).await
    }

    async fn stats(&self, queue: &str) -> Result<DriverStats, StorageError> {
        self.inner().stats(queue).await
    }

    async fn clear(&self, queue: &str) -> Result<usize, StorageError> {
        self.inner().clear(queue).await
    }

    async fn add_dead(&self, entry: DeadLetterEntry) -> Result<(), StorageError> {
        self.inner().add_dead(entry).await
    }

    async fn list_dead(&self, queue: Option<&str>) -> Result<Vec<DeadLetterEntry>, StorageError> {
        self.inner().list_dead(queue).await
    }

    async fn get_dead(&self, job_id: &str) -> Result<Option<DeadLetterEntry>, StorageError> {
        self.inner().get_dead(job_id).await
    }

    async fn remove_dead(&self, job_id: &str) -> Result<Option<DeadLetterEntry>, StorageError> {
        self.inner().remove_dead(job_id).await
    }
}
