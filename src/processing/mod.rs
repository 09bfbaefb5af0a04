//! Job Processing Engine
//!
//! This module contains the job contract ([`Task`]), the type-tag registry that
//! rebuilds jobs from storage, the retry policy, the job-scoped middleware
//! pipeline and the [`Worker`] polling loop.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;

use crate::core::{DEFAULT_MAX_ATTEMPTS, DEFAULT_QUEUE};
use crate::error::Result;

pub mod context;
pub mod executor;
pub mod middleware;
pub mod registry;
pub mod retry;
pub mod worker;

pub use context::JobContext;
pub use executor::JobExecutor;
pub use middleware::{
    ContextMiddleware, DedupMiddleware, LoggingMiddleware, Middleware, MiddlewarePipeline, Next,
};
pub use registry::{JobRegistry, RunnableJob};
pub use retry::{Backoff, RetryDecision, RetryPolicy};
pub use worker::{ProcessOutcome, ShutdownPolicy, Worker, WorkerConfig, WorkerHandle};

/// A concrete kind of job.
///
/// Implementors are plain serde types; their fields are the job payload.
/// Register each type once with [`JobRegistry::register`] so workers can
/// rebuild it from storage by [`Task::TYPE_TAG`].
///
/// ```rust
/// use async_trait::async_trait;
/// use jobwell::{JobContext, JobOutcome, JobResult, Task};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct SendWelcome {
///     email: String,
/// }
///
/// #[async_trait]
/// impl Task for SendWelcome {
///     const TYPE_TAG: &'static str = "send_welcome";
///
///     async fn handle(&self, _ctx: &JobContext) -> JobResult {
///         if self.email.is_empty() {
///             return Err(jobwell::JobFailure::fatal("missing address"));
///         }
///         Ok(JobOutcome::Completed)
///     }
///
///     fn queue(&self) -> &str {
///         "mail"
///     }
/// }
/// ```
#[async_trait]
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable identifier stored with every job of this type
    const TYPE_TAG: &'static str;

    /// Do the work.
    async fn handle(&self, ctx: &JobContext) -> JobResult;

    /// Serialize the task's state into a payload.
    fn to_payload(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Rebuild the task from a stored payload.
    fn from_payload(payload: &Value) -> Result<Self> {
        Ok(serde_json::from_value(payload.clone())?)
    }

    /// Retries allowed after the first failed execution
    fn max_attempts(&self) -> u32 {
        DEFAULT_MAX_ATTEMPTS
    }

    /// Delay function applied between retries
    fn backoff(&self) -> Backoff {
        Backoff::default()
    }

    /// Queue the task is dispatched to
    fn queue(&self) -> &str {
        DEFAULT_QUEUE
    }

    /// Priority within the queue (higher first)
    fn priority(&self) -> i32 {
        0
    }
}

/// Successful end of an execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The handler ran and finished its work
    Completed,
    /// A middleware short-circuited the handler; treated as success
    Skipped { reason: String },
}

impl JobOutcome {
    /// Create a skipped outcome
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }

    /// Check if the handler was skipped
    pub fn is_skipped(&self) -> bool {
        matches!(self, JobOutcome::Skipped { .. })
    }
}

/// Failed end of an execution.
///
/// Any `std::error::Error` converts into a retryable failure, so handlers can
/// use `?` on ordinary fallible calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobFailure {
    /// Transient failure; the retry policy decides what happens next
    Retry { message: String },
    /// Permanent failure; the job is dead-lettered without further retries
    Fatal { message: String },
}

impl JobFailure {
    /// Create a retryable failure
    pub fn retry(message: impl Into<String>) -> Self {
        Self::Retry {
            message: message.into(),
        }
    }

    /// Create a fatal failure
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    /// The failure message
    pub fn message(&self) -> &str {
        match self {
            JobFailure::Retry { message } | JobFailure::Fatal { message } => message,
        }
    }

    /// Check if the failure is fatal
    pub fn is_fatal(&self) -> bool {
        matches!(self, JobFailure::Fatal { .. })
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobFailure::Retry { message } => write!(f, "{}", message),
            JobFailure::Fatal { message } => write!(f, "fatal: {}", message),
        }
    }
}

impl<E> From<E> for JobFailure
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        JobFailure::retry(err.to_string())
    }
}

/// Result returned by handlers and middleware.
pub type JobResult = std::result::Result<JobOutcome, JobFailure>;
