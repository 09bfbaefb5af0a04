//! # jobwell
//!
//! Asynchronous background job processing with pluggable storage drivers,
//! per-job retry policies, a dead-letter queue and a job-scoped middleware
//! pipeline.
//!
//! ## 🚀 **Features**
//!
//! - **4 Storage Drivers**: Memory, File (JSON Lines), Sync (inline) and Redis
//! - **Atomic Reservation**: concurrent workers never receive the same live job
//! - **Crash Recovery**: expired reservations return to pending (at-least-once)
//! - **Retries**: immediate, fixed, linear or capped exponential backoff
//! - **Dead-Letter Queue**: inspect, retry as a fresh job, or purge
//! - **Middleware**: logging, deduplication and context injection around handlers
//! - **Metrics**: per-queue atomic counters plus driver gauges
//!
//! ## 🎯 **Defining and dispatching a job**
//!
//! ```rust
//! use async_trait::async_trait;
//! use jobwell::{JobContext, JobOutcome, JobRegistry, JobResult, QueueManager, Task};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct SendEmail {
//!     to: String,
//! }
//!
//! #[async_trait]
//! impl Task for SendEmail {
//!     const TYPE_TAG: &'static str = "send_email";
//!
//!     async fn handle(&self, _ctx: &JobContext) -> JobResult {
//!         println!("Sending email to: {}", self.to);
//!         Ok(JobOutcome::Completed)
//!     }
//! }
//!
//! # tokio_test::block_on(async {
//! let mut registry = JobRegistry::new();
//! registry.register::<SendEmail>();
//!
//! let manager = QueueManager::new(registry);
//! let receipt = manager
//!     .dispatch(&SendEmail { to: "user@example.com".into() })
//!     .await
//!     .unwrap();
//!
//! let outcome = manager.process_once("default").await.unwrap();
//! assert!(outcome.did_work());
//! assert_eq!(manager.stats("default").await.unwrap().succeeded_total, 1);
//! # let _ = receipt;
//! # });
//! ```
//!
//! ## ⚡ **Running workers**
//!
//! ```rust,no_run
//! use jobwell::{JobRegistry, QueueManager, WorkerConfig};
//! use std::time::Duration;
//!
//! # async fn example() -> jobwell::Result<()> {
//! let manager = QueueManager::new(JobRegistry::new());
//! let worker = manager.worker(
//!     WorkerConfig::new("worker-1")
//!         .queue("default")
//!         .visibility_timeout(Duration::from_secs(120)),
//! )?;
//!
//! let handle = worker.handle();
//! tokio::spawn(async move {
//!     tokio::time::sleep(Duration::from_secs(3600)).await;
//!     handle.shutdown();
//! });
//!
//! worker.run().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## 🔧 **Configuration**
//!
//! Drivers are built from a [`DriverConfig`], either constructed in code or
//! read from `QUEUE_*` environment variables with [`QueueSettings::from_env`].
//!
//! ```rust,ignore
//! let settings = QueueSettings::from_env()?;
//! jobwell::telemetry::init_tracing(&settings.log_level);
//! let manager = QueueManager::from_config(settings.driver, registry, pipeline).await?;
//! ```
//!
//! ## Delivery guarantees
//!
//! Delivery is **at-least-once**. A worker that dies after its handler
//! finished but before acknowledging leaves the job reserved; once the
//! visibility timeout passes the job is handed out again. Handlers should be
//! idempotent, or run behind [`DedupMiddleware`].
//!
//! The `sync` driver runs jobs inline during dispatch. It ignores delays and
//! bypasses retries and the dead-letter queue; a failure is returned to the
//! dispatching caller.

pub mod core;
pub mod dead_letter;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod processing;
pub mod storage;
pub mod telemetry;

// Re-export main types for convenience
pub use core::{DeadLetterEntry, Job, JobStatus};
pub use dead_letter::DeadLetterQueue;
pub use error::{QueueError, Result};
pub use manager::{DispatchOptions, DispatchReceipt, QueueManager};
pub use metrics::{CounterSnapshot, QueueMetrics, StatsSnapshot};
pub use processing::{
    Backoff, ContextMiddleware, DedupMiddleware, JobContext, JobExecutor, JobFailure, JobOutcome,
    JobRegistry, JobResult, LoggingMiddleware, Middleware, MiddlewarePipeline, ProcessOutcome,
    RetryDecision, RetryPolicy, ShutdownPolicy, Task, Worker, WorkerConfig, WorkerHandle,
};
pub use storage::{
    DriverConfig, DriverInstance, DriverStats, FileConfig, FileDriver, MemoryConfig, MemoryDriver,
    PushOutcome, QueueSettings, StorageDriver, StorageError, SyncDriver,
};

#[cfg(feature = "redis")]
pub use storage::{RedisConfig, RedisDriver};
