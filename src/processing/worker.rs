//! Worker polling loop.
//!
//! One iteration ([`Worker::process_once`]) is: reserve → middleware chain →
//! handler → ack / release / dead-letter → metrics. [`Worker::run`] repeats it
//! until a [`WorkerHandle`] asks it to stop, sleeping a jittered poll interval
//! whenever the queue is empty. Handler failures never end the loop; driver
//! errors are logged and retried after `error_backoff`.
//!
//! A handler that outlives the visibility timeout loses its job: settling is
//! refused by the driver, nothing is recorded, and the result is
//! [`ProcessOutcome::ReservationLost`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{JobExecutor, JobFailure, JobOutcome, JobResult, RetryDecision, RetryPolicy};
use crate::core::{DEFAULT_QUEUE, Job};
use crate::error::Result;
use crate::metrics::QueueMetrics;
use crate::storage::{StorageDriver, StorageError};

/// What happens to an in-flight job when shutdown is requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ShutdownPolicy {
    /// Let the current job finish, however long it takes
    #[default]
    WaitForCompletion,
    /// Abandon the current job once `grace` has passed after the stop signal.
    ///
    /// The job stays reserved and is picked up again when its reservation
    /// expires.
    CancelAfter { grace: Duration },
}

/// Configuration for worker instances
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Unique identifier for the worker
    pub worker_id: String,
    /// Queue this worker reserves from
    pub queue: String,
    /// How long a reserved job stays hidden from other workers
    pub visibility_timeout: Duration,
    /// Sleep between polls of an empty queue
    pub poll_interval: Duration,
    /// Upper bound of the random delay added to each poll sleep
    pub poll_jitter: Duration,
    /// Maximum handler run time; `None` means unbounded
    pub job_timeout: Option<Duration>,
    /// Sleep after a driver error before polling again
    pub error_backoff: Duration,
    /// Behaviour of in-flight jobs on shutdown
    pub shutdown_policy: ShutdownPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: uuid::Uuid::new_v4().to_string(),
            queue: DEFAULT_QUEUE.to_string(),
            visibility_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            poll_jitter: Duration::from_millis(250),
            job_timeout: None,
            error_backoff: Duration::from_secs(5),
            shutdown_policy: ShutdownPolicy::default(),
        }
    }
}

impl WorkerConfig {
    /// Create a new worker configuration with the specified worker ID
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }

    /// Set the queue to process
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Set the visibility timeout
    pub fn visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Set the polling interval
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the maximum poll jitter
    pub fn poll_jitter(mut self, jitter: Duration) -> Self {
        self.poll_jitter = jitter;
        self
    }

    /// Set the job timeout
    pub fn job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }

    /// Set the backoff after driver errors
    pub fn error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    /// Set the shutdown policy
    pub fn shutdown_policy(mut self, policy: ShutdownPolicy) -> Self {
        self.shutdown_policy = policy;
        self
    }
}

/// Result of one [`Worker::process_once`] iteration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// No job was eligible
    Idle,
    /// The handler completed and the job was acked
    Completed { job_id: String },
    /// Middleware skipped the handler; the job was acked
    Skipped { job_id: String },
    /// The job failed and was released for another attempt
    Retried {
        job_id: String,
        attempts: u32,
        delay: Duration,
    },
    /// The job failed for the last time and was dead-lettered
    DeadLettered { job_id: String, reason: String },
    /// Shutdown cancelled the job; it stays reserved until its deadline
    Abandoned { job_id: String },
    /// The reservation expired while the handler ran; the job was left
    /// untouched for the worker that reserved it next
    ReservationLost { job_id: String },
}

impl ProcessOutcome {
    /// Check if a job was reserved in this iteration
    pub fn did_work(&self) -> bool {
        !matches!(self, ProcessOutcome::Idle)
    }
}

/// Cloneable handle used to stop a running [`Worker`]
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    stop: Arc<watch::Sender<bool>>,
}

impl WorkerHandle {
    /// Ask the worker to stop. It finishes or abandons the current job
    /// according to its [`ShutdownPolicy`] and reserves nothing new.
    pub fn shutdown(&self) {
        self.stop.send_replace(true);
    }

    /// Check if shutdown was requested
    pub fn is_shutdown(&self) -> bool {
        *self.stop.borrow()
    }
}

/// Polls one queue of one driver and executes what it reserves
pub struct Worker {
    config: WorkerConfig,
    driver: Arc<dyn StorageDriver>,
    executor: Arc<JobExecutor>,
    metrics: Arc<QueueMetrics>,
    stop: Arc<watch::Sender<bool>>,
}

impl Worker {
    /// Create a new worker
    pub fn new(
        config: WorkerConfig,
        driver: Arc<dyn StorageDriver>,
        executor: Arc<JobExecutor>,
        metrics: Arc<QueueMetrics>,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            config,
            driver,
            executor,
            metrics,
            stop: Arc::new(stop),
        }
    }

    /// The worker's configuration
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Handle for stopping this worker from another task
    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            stop: self.stop.clone(),
        }
    }

    fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Run until shutdown is requested.
    pub async fn run(&self) -> Result<()> {
        info!(
            worker_id = %self.config.worker_id,
            queue = %self.config.queue,
            driver = self.driver.name(),
            "Worker started"
        );

        while !self.is_stopped() {
            let pause = match self.process_once().await {
                Ok(ProcessOutcome::Idle) => self.poll_delay(),
                Ok(ProcessOutcome::Abandoned { .. }) => break,
                Ok(_) => continue,
                Err(e) => {
                    error!(
                        worker_id = %self.config.worker_id,
                        error = %e,
                        "Worker iteration failed"
                    );
                    self.config.error_backoff
                }
            };

            if self.pause(pause).await {
                break;
            }
        }

        info!(worker_id = %self.config.worker_id, "Worker stopped");
        Ok(())
    }

    /// Reserve and settle at most one job.
    pub async fn process_once(&self) -> Result<ProcessOutcome> {
        if self.is_stopped() {
            return Ok(ProcessOutcome::Idle);
        }

        let Some(job) = self
            .driver
            .reserve(&self.config.queue, self.config.visibility_timeout)
            .await?
        else {
            return Ok(ProcessOutcome::Idle);
        };

        debug!(
            job_id = %job.id,
            type_tag = %job.type_tag,
            worker_id = %self.config.worker_id,
            "Reserved job"
        );

        let Some(result) = self.execute(&job).await else {
            warn!(
                job_id = %job.id,
                "Shutdown grace period expired; abandoning job until its reservation expires"
            );
            return Ok(ProcessOutcome::Abandoned { job_id: job.id });
        };

        self.settle(job, result).await
    }

    /// Execute under the shutdown policy; `None` if the job was abandoned.
    async fn execute(&self, job: &Job) -> Option<JobResult> {
        let run = self
            .executor
            .execute(job, &self.config.worker_id, self.config.job_timeout);

        match self.config.shutdown_policy {
            ShutdownPolicy::WaitForCompletion => Some(run.await),
            ShutdownPolicy::CancelAfter { grace } => {
                let mut stop = self.stop.subscribe();
                let deadline = async move {
                    if stop.wait_for(|stopped| *stopped).await.is_err() {
                        futures::future::pending::<()>().await;
                    }
                    tokio::time::sleep(grace).await;
                };

                tokio::select! {
                    result = run => Some(result),
                    _ = deadline => None,
                }
            }
        }
    }

    async fn settle(&self, mut job: Job, result: JobResult) -> Result<ProcessOutcome> {
        let queue = job.queue.clone();

        let failure = match result {
            Ok(JobOutcome::Completed) => {
                if !self.still_held(&job, self.driver.ack(&job).await)? {
                    return Ok(ProcessOutcome::ReservationLost { job_id: job.id });
                }
                self.metrics.record_succeeded(&queue);
                return Ok(ProcessOutcome::Completed { job_id: job.id });
            }
            Ok(JobOutcome::Skipped { reason }) => {
                if !self.still_held(&job, self.driver.ack(&job).await)? {
                    return Ok(ProcessOutcome::ReservationLost { job_id: job.id });
                }
                self.metrics.record_skipped(&queue);
                debug!(job_id = %job.id, %reason, "Job skipped by middleware");
                return Ok(ProcessOutcome::Skipped { job_id: job.id });
            }
            Err(failure) => failure,
        };

        let attempts = job.attempts + 1;
        let decision = match &failure {
            JobFailure::Fatal { .. } => RetryDecision::Exhausted,
            JobFailure::Retry { .. } => RetryPolicy::evaluate_job(&job, attempts),
        };

        match decision {
            RetryDecision::Retry { delay } => {
                let available_at = chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|delay| Utc::now().checked_add_signed(delay))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                let released = self
                    .driver
                    .release(&job, available_at, Some(failure.message()))
                    .await;
                if !self.still_held(&job, released)? {
                    return Ok(ProcessOutcome::ReservationLost { job_id: job.id });
                }
                self.metrics.record_failed(&queue);
                self.metrics.record_retried(&queue);

                warn!(
                    job_id = %job.id,
                    attempts,
                    max_attempts = job.max_attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %failure,
                    "Job failed, scheduled for retry"
                );
                Ok(ProcessOutcome::Retried {
                    job_id: job.id,
                    attempts,
                    delay,
                })
            }
            RetryDecision::Exhausted => {
                let reason = failure.message().to_string();
                job.attempts = attempts;
                let moved = self.driver.move_to_dlq(&job, &reason).await.map(|_| ());
                if !self.still_held(&job, moved)? {
                    return Ok(ProcessOutcome::ReservationLost { job_id: job.id });
                }
                self.metrics.record_failed(&queue);
                self.metrics.record_dead_lettered(&queue);

                error!(
                    job_id = %job.id,
                    attempts,
                    fatal = failure.is_fatal(),
                    error = %failure,
                    "Job moved to dead-letter queue"
                );
                Ok(ProcessOutcome::DeadLettered {
                    job_id: job.id,
                    reason,
                })
            }
        }
    }

    /// `Ok(false)` if the reservation expired and the job now belongs to
    /// whoever reserved it next.
    fn still_held(
        &self,
        job: &Job,
        settled: std::result::Result<(), StorageError>,
    ) -> Result<bool> {
        match settled {
            Ok(()) => Ok(true),
            Err(e) if e.is_reservation_lost() => {
                warn!(
                    job_id = %job.id,
                    worker_id = %self.config.worker_id,
                    "Reservation expired before the job was settled; leaving it to its current holder"
                );
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn poll_delay(&self) -> Duration {
        let jitter_ms = u64::try_from(self.config.poll_jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = if jitter_ms == 0 {
            0
        } else {
            fastrand::u64(0..=jitter_ms)
        };
        self.config.poll_interval + Duration::from_millis(jitter)
    }

    /// Sleep for `duration`; returns `true` if shutdown interrupted it.
    async fn pause(&self, duration: Duration) -> bool {
        let mut stop = self.stop.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.is_stopped(),
            _ = stop.wait_for(|stopped| *stopped) => true,
        }
    }
}
