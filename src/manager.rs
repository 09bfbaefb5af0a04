//! The producer-facing façade.
//!
//! A [`QueueManager`] owns a map of named drivers, one of which is active,
//! and the executor shared by every worker it hands out. There is no global
//! instance: applications construct one at startup and pass it where needed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::Job;
use crate::dead_letter::DeadLetterQueue;
use crate::error::{QueueError, Result};
use crate::metrics::{QueueMetrics, StatsSnapshot};
use crate::processing::{
    JobExecutor, JobOutcome, JobRegistry, MiddlewarePipeline, ProcessOutcome, Task, Worker,
    WorkerConfig,
};
use crate::storage::{
    DriverConfig, DriverInstance, MemoryDriver, PushOutcome, StorageDriver, SyncDriver,
};

/// Per-dispatch overrides of what the task itself declares
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchOptions {
    /// Hold the job back for this long
    pub delay: Duration,
    /// Queue other than [`Task::queue`]
    pub queue: Option<String>,
    /// Priority other than [`Task::priority`]
    pub priority: Option<i32>,
    /// Idempotency key consulted by deduplication middleware
    pub unique_key: Option<String>,
}

impl DispatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn unique_key(mut self, key: impl Into<String>) -> Self {
        self.unique_key = Some(key.into());
        self
    }
}

/// What a successful dispatch produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReceipt {
    /// Id assigned to the job
    pub job_id: String,
    pub queue: String,
    /// Driver that accepted it
    pub driver: String,
    /// Earliest time a worker may reserve it
    pub available_at: DateTime<Utc>,
    /// True when a synchronous driver ran the job inline
    pub executed: bool,
}

/// Driver registry, dispatch and stats
pub struct QueueManager {
    drivers: RwLock<HashMap<String, Arc<dyn StorageDriver>>>,
    active: RwLock<String>,
    executor: Arc<JobExecutor>,
    metrics: Arc<QueueMetrics>,
}

impl QueueManager {
    /// Manager with the `memory` driver active and `sync` registered
    pub fn new(registry: JobRegistry) -> Self {
        Self::with_pipeline(registry, MiddlewarePipeline::new())
    }

    /// Like [`new`](Self::new), running every job through `pipeline`
    pub fn with_pipeline(registry: JobRegistry, pipeline: MiddlewarePipeline) -> Self {
        let executor = Arc::new(JobExecutor::with_pipeline(Arc::new(registry), pipeline));

        let mut drivers: HashMap<String, Arc<dyn StorageDriver>> = HashMap::new();
        drivers.insert("memory".to_string(), Arc::new(MemoryDriver::new()));
        drivers.insert(
            "sync".to_string(),
            Arc::new(SyncDriver::new(executor.clone())),
        );

        Self {
            drivers: RwLock::new(drivers),
            active: RwLock::new("memory".to_string()),
            executor,
            metrics: Arc::new(QueueMetrics::new()),
        }
    }

    /// Build the configured driver, register it under its name and make it
    /// active.
    pub async fn from_config(
        config: DriverConfig,
        registry: JobRegistry,
        pipeline: MiddlewarePipeline,
    ) -> Result<Self> {
        let manager = Self::with_pipeline(registry, pipeline);
        let name = config.name();
        let driver = DriverInstance::from_config(config, manager.executor.clone()).await?;
        manager.set_driver(name, driver.into_shared());
        manager.use_driver(name)?;
        Ok(manager)
    }

    /// Register (or replace) a driver under `name`. Does not change which
    /// driver is active, and jobs are never migrated between drivers.
    pub fn set_driver(&self, name: impl Into<String>, driver: Arc<dyn StorageDriver>) {
        let name = name.into();
        let mut drivers = self.drivers.write().unwrap_or_else(|p| p.into_inner());
        if drivers.insert(name.clone(), driver).is_some() {
            warn!(driver = %name, "Replaced registered driver");
        }
    }

    /// Make `name` the active driver
    pub fn use_driver(&self, name: &str) -> Result<()> {
        let drivers = self.drivers.read().unwrap_or_else(|p| p.into_inner());
        if !drivers.contains_key(name) {
            return Err(QueueError::DriverNotRegistered {
                name: name.to_string(),
            });
        }

        let mut active = self.active.write().unwrap_or_else(|p| p.into_inner());
        if *active != name {
            info!(from = %active, to = %name, "Switched active driver");
            *active = name.to_string();
        }
        Ok(())
    }

    /// Name of the active driver
    pub fn active_driver(&self) -> String {
        self.active
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Names of every registered driver, sorted
    pub fn registered_drivers(&self) -> Vec<String> {
        let drivers = self.drivers.read().unwrap_or_else(|p| p.into_inner());
        let mut names: Vec<String> = drivers.keys().cloned().collect();
        names.sort();
        names
    }

    /// The active driver
    pub fn driver(&self) -> Result<Arc<dyn StorageDriver>> {
        let name = self.active_driver();
        self.named_driver(&name)
    }

    /// A registered driver by name
    pub fn named_driver(&self, name: &str) -> Result<Arc<dyn StorageDriver>> {
        let drivers = self.drivers.read().unwrap_or_else(|p| p.into_inner());
        drivers
            .get(name)
            .cloned()
            .ok_or_else(|| QueueError::DriverNotRegistered {
                name: name.to_string(),
            })
    }

    /// Shared counters
    pub fn metrics(&self) -> Arc<QueueMetrics> {
        self.metrics.clone()
    }

    /// Executor shared by workers and the synchronous driver
    pub fn executor(&self) -> Arc<JobExecutor> {
        self.executor.clone()
    }

    /// Dispatch a task with its own defaults
    pub async fn dispatch<T: Task>(&self, task: &T) -> Result<DispatchReceipt> {
        self.dispatch_with(task, DispatchOptions::default()).await
    }

    /// Dispatch a task with per-call overrides
    pub async fn dispatch_with<T: Task>(
        &self,
        task: &T,
        options: DispatchOptions,
    ) -> Result<DispatchReceipt> {
        let mut job = Job::from_task(task)?;
        if let Some(queue) = options.queue {
            job.queue = queue;
        }
        if let Some(priority) = options.priority {
            job.priority = priority;
        }
        if let Some(key) = options.unique_key {
            job.unique_key = Some(key);
        }
        self.dispatch_job(job, options.delay).await
    }

    /// Dispatch a prepared record.
    ///
    /// Assigns a fresh id and sets `available_at = now + delay`. With the
    /// synchronous driver the job runs before this returns and a handler
    /// failure surfaces as [`QueueError::HandlerFailed`].
    pub async fn dispatch_job(&self, mut job: Job, delay: Duration) -> Result<DispatchReceipt> {
        let now = Utc::now();
        let available_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .ok_or_else(|| QueueError::InvalidJobData {
                message: format!("dispatch delay {:?} out of range", delay),
            })?;

        job.id = Uuid::new_v4().to_string();
        job.created_at = now;
        job.available_at = available_at;
        job.clear_reservation();

        let driver = self.driver()?;
        let receipt = DispatchReceipt {
            job_id: job.id.clone(),
            queue: job.queue.clone(),
            driver: driver.name().to_string(),
            available_at,
            executed: false,
        };

        match driver.push(job).await? {
            PushOutcome::Queued => {
                self.metrics.record_dispatched(&receipt.queue);
                debug!(
                    job_id = %receipt.job_id,
                    queue = %receipt.queue,
                    driver = %receipt.driver,
                    delay_ms = delay.as_millis() as u64,
                    "Dispatched job"
                );
                Ok(receipt)
            }
            PushOutcome::Executed(result) => {
                self.metrics.record_dispatched(&receipt.queue);
                match result {
                    Ok(JobOutcome::Completed) => self.metrics.record_succeeded(&receipt.queue),
                    Ok(JobOutcome::Skipped { .. }) => self.metrics.record_skipped(&receipt.queue),
                    Err(failure) => {
                        self.metrics.record_failed(&receipt.queue);
                        return Err(QueueError::HandlerFailed {
                            job_id: receipt.job_id,
                            message: failure.to_string(),
                        });
                    }
                }
                Ok(DispatchReceipt {
                    executed: true,
                    ..receipt
                })
            }
        }
    }

    /// Dispatch each job independently; one failure does not stop the rest.
    /// Results are in input order.
    pub async fn dispatch_batch(
        &self,
        jobs: impl IntoIterator<Item = Job>,
    ) -> Vec<Result<DispatchReceipt>> {
        let mut results = Vec::new();
        for job in jobs {
            results.push(self.dispatch_job(job, Duration::ZERO).await);
        }

        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            warn!(total = results.len(), failed, "Batch dispatch partially failed");
        }
        results
    }

    /// Stats for `queue` on the active driver
    pub async fn stats(&self, queue: &str) -> Result<StatsSnapshot> {
        let driver = self.driver()?;
        let stats = driver.stats(queue).await?;
        Ok(StatsSnapshot::new(
            driver.name(),
            queue,
            stats,
            self.metrics.snapshot(queue),
        ))
    }

    /// Run one worker iteration against `queue` on the active driver
    pub async fn process_once(&self, queue: &str) -> Result<ProcessOutcome> {
        let worker = self.worker(WorkerConfig::new("manager").queue(queue))?;
        worker.process_once().await
    }

    /// A worker bound to the active driver
    pub fn worker(&self, config: WorkerConfig) -> Result<Worker> {
        Ok(Worker::new(
            config,
            self.driver()?,
            self.executor.clone(),
            self.metrics.clone(),
        ))
    }

    /// Dead-letter queue of the active driver
    pub fn dead_letters(&self) -> Result<DeadLetterQueue> {
        Ok(DeadLetterQueue::new(self.driver()?).with_metrics(self.metrics.clone()))
    }

    /// Drop every pending and reserved job of `queue` on the active driver
    pub async fn clear(&self, queue: &str) -> Result<usize> {
        Ok(self.driver()?.clear(queue).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::{JobContext, JobFailure, JobResult};
    use crate::storage::MemoryConfig;
    use async_trait::async_trait;

    #[derive(Debug, Serialize, Deserialize)]
    struct Resize {
        width: u32,
    }

    #[async_trait]
    impl Task for Resize {
        const TYPE_TAG: &'static str = "resize";

        async fn handle(&self, _ctx: &JobContext) -> JobResult {
            if self.width == 0 {
                return Err(JobFailure::fatal("zero width"));
            }
            Ok(JobOutcome::Completed)
        }
    }

    fn manager() -> QueueManager {
        let mut registry = JobRegistry::new();
        registry.register::<Resize>();
        QueueManager::new(registry)
    }

    #[tokio::test]
    async fn test_dispatch_assigns_id_and_delay() {
        let manager = manager();
        let before = Utc::now();
        let receipt = manager
            .dispatch_with(
                &Resize { width: 10 },
                DispatchOptions::new()
                    .delay(Duration::from_secs(30))
                    .queue("images")
                    .priority(4),
            )
            .await
            .unwrap();

        assert_eq!(receipt.driver, "memory");
        assert_eq!(receipt.queue, "images");
        assert!(!receipt.executed);
        assert!(receipt.available_at >= before + chrono::Duration::seconds(30));

        let job = manager
            .driver()
            .unwrap()
            .get(&receipt.job_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.priority, 4);
        assert_eq!(job.type_tag, "resize");
        assert_eq!(manager.metrics().snapshot("images").dispatched, 1);
    }

    #[tokio::test]
    async fn test_use_driver_unknown_name() {
        let manager = manager();
        assert_eq!(
            manager.use_driver("postgres"),
            Err(QueueError::DriverNotRegistered {
                name: "postgres".to_string()
            })
        );
        assert_eq!(manager.active_driver(), "memory");
        assert_eq!(manager.registered_drivers(), vec!["memory", "sync"]);
    }

    #[tokio::test]
    async fn test_sync_driver_reports_handler_failure() {
        let manager = manager();
        manager.use_driver("sync").unwrap();

        let ok = manager.dispatch(&Resize { width: 5 }).await.unwrap();
        assert!(ok.executed);

        let err = manager.dispatch(&Resize { width: 0 }).await.unwrap_err();
        assert!(matches!(err, QueueError::HandlerFailed { .. }));

        let counters = manager.metrics().snapshot("default");
        assert_eq!(counters.succeeded, 1);
        assert_eq!(counters.failed, 1);
    }

    #[tokio::test]
    async fn test_batch_partial_failure() {
        let manager = manager();
        manager.set_driver(
            "small",
            Arc::new(MemoryDriver::with_config(MemoryConfig::new().with_max_jobs(2))),
        );
        manager.use_driver("small").unwrap();

        let jobs: Vec<Job> = (1..=3)
            .map(|w| Job::from_task(&Resize { width: w }).unwrap())
            .collect();
        let results = manager.dispatch_batch(jobs).await;

        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
        assert!(matches!(results[2], Err(QueueError::DriverError { .. })));
        assert_eq!(manager.stats("default").await.unwrap().pending, 2);
    }

    #[tokio::test]
    async fn test_from_config_selects_driver() {
        let dir = tempfile::tempdir().unwrap();
        let config = DriverConfig::File(crate::storage::FileConfig::new(dir.path()));
        let manager = QueueManager::from_config(config, JobRegistry::new(), MiddlewarePipeline::new())
            .await
            .unwrap();
        assert_eq!(manager.active_driver(), "file");
    }
}
