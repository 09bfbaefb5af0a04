//! Runs a single job through the middleware pipeline.
//!
//! The executor is the boundary where anything a handler does wrong becomes a
//! [`JobFailure`]: returned errors, panics and timeouts alike. It is shared by
//! the [`Worker`](super::Worker) and the synchronous driver.

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

use super::{JobContext, JobFailure, JobRegistry, JobResult, MiddlewarePipeline};
use crate::core::Job;

/// Executes jobs with a registry and a middleware pipeline.
#[derive(Debug, Clone)]
pub struct JobExecutor {
    registry: Arc<JobRegistry>,
    pipeline: MiddlewarePipeline,
}

impl JobExecutor {
    /// Create an executor without middleware
    pub fn new(registry: Arc<JobRegistry>) -> Self {
        Self::with_pipeline(registry, MiddlewarePipeline::new())
    }

    /// Create an executor with a middleware pipeline
    pub fn with_pipeline(registry: Arc<JobRegistry>, pipeline: MiddlewarePipeline) -> Self {
        Self { registry, pipeline }
    }

    /// The type-tag registry
    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// The middleware pipeline
    pub fn pipeline(&self) -> &MiddlewarePipeline {
        &self.pipeline
    }

    /// Execute `job` once on behalf of `worker_id`.
    ///
    /// Never panics and never returns a driver error: the result only says
    /// whether the job succeeded, should be retried or is fatally broken.
    pub async fn execute(
        &self,
        job: &Job,
        worker_id: &str,
        timeout: Option<Duration>,
    ) -> JobResult {
        let ctx = JobContext::for_job(job, worker_id);
        let run = AssertUnwindSafe(self.pipeline.execute(job, &ctx, &self.registry)).catch_unwind();

        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(job_id = %job.id, "Job timed out after {:?}", limit);
                    return Err(JobFailure::retry(format!(
                        "job timed out after {:?}",
                        limit
                    )));
                }
            },
            None => run.await,
        };

        match outcome {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(job_id = %job.id, "Job panicked: {}", message);
                Err(JobFailure::retry(format!("job panicked: {}", message)))
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::{JobOutcome, Task};
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    enum Behaviour {
        Succeed,
        Panic,
        Sleep(u64),
        Fail,
    }

    #[async_trait]
    impl Task for Behaviour {
        const TYPE_TAG: &'static str = "executor_behaviour";

        async fn handle(&self, _ctx: &JobContext) -> JobResult {
            match self {
                Behaviour::Succeed => Ok(JobOutcome::Completed),
                Behaviour::Panic => panic!("handler exploded"),
                Behaviour::Sleep(ms) => {
                    tokio::time::sleep(Duration::from_millis(*ms)).await;
                    Ok(JobOutcome::Completed)
                }
                Behaviour::Fail => {
                    let parsed: u32 = "not a number".parse()?;
                    Ok(JobOutcome::skipped(parsed.to_string()))
                }
            }
        }
    }

    fn executor() -> JobExecutor {
        let mut registry = JobRegistry::new();
        registry.register::<Behaviour>();
        JobExecutor::new(Arc::new(registry))
    }

    async fn run(behaviour: Behaviour, timeout: Option<Duration>) -> JobResult {
        let job = Job::from_task(&behaviour).unwrap();
        executor().execute(&job, "worker-1", timeout).await
    }

    #[tokio::test]
    async fn test_success() {
        assert_eq!(run(Behaviour::Succeed, None).await, Ok(JobOutcome::Completed));
    }

    #[tokio::test]
    async fn test_panic_becomes_retryable_failure() {
        let failure = run(Behaviour::Panic, None).await.unwrap_err();
        assert!(!failure.is_fatal());
        assert!(failure.message().contains("handler exploded"));
    }

    #[tokio::test]
    async fn test_timeout_becomes_retryable_failure() {
        let failure = run(Behaviour::Sleep(500), Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(!failure.is_fatal());
        assert!(failure.message().contains("timed out"));

        assert!(
            run(Behaviour::Sleep(1), Some(Duration::from_secs(5)))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_question_mark_on_std_error_is_retryable() {
        let failure = run(Behaviour::Fail, None).await.unwrap_err();
        assert!(matches!(failure, JobFailure::Retry { .. }));
    }
}
