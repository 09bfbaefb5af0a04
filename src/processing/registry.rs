//! Type-tag registry for rebuilding jobs from storage.
//!
//! Every [`Task`] type an application dispatches is registered once at
//! startup. Workers look up the stored `type_tag` and hand the payload to the
//! matching constructor; nothing is discovered at runtime.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

use super::{JobContext, JobResult, Task};
use crate::core::Job;
use crate::error::{QueueError, Result};

/// A job rebuilt from its payload, ready to execute.
#[async_trait]
pub trait RunnableJob: Send + Sync {
    /// Execute the job
    async fn run(&self, ctx: &JobContext) -> JobResult;
}

#[async_trait]
impl<T: Task> RunnableJob for T {
    async fn run(&self, ctx: &JobContext) -> JobResult {
        self.handle(ctx).await
    }
}

type Constructor = Box<dyn Fn(&Value) -> Result<Box<dyn RunnableJob>> + Send + Sync>;

/// Maps type tags to constructors.
#[derive(Default)]
pub struct JobRegistry {
    constructors: HashMap<String, Constructor>,
}

impl JobRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Register a task type under its [`Task::TYPE_TAG`].
    ///
    /// Registering the same tag twice replaces the earlier constructor.
    pub fn register<T: Task>(&mut self) -> &mut Self {
        self.constructors.insert(
            T::TYPE_TAG.to_string(),
            Box::new(|payload: &Value| {
                let task = T::from_payload(payload)?;
                Ok(Box::new(task) as Box<dyn RunnableJob>)
            }),
        );
        self
    }

    /// Rebuild the runnable job for a stored record.
    pub fn resolve(&self, job: &Job) -> Result<Box<dyn RunnableJob>> {
        let constructor =
            self.constructors
                .get(&job.type_tag)
                .ok_or_else(|| QueueError::UnknownJobType {
                    type_tag: job.type_tag.clone(),
                })?;

        constructor(&job.payload).map_err(|e| QueueError::SerializationError {
            message: format!("cannot rebuild '{}' from payload: {}", job.type_tag, e),
        })
    }

    /// Check if a type tag is registered
    pub fn has_type(&self, type_tag: &str) -> bool {
        self.constructors.contains_key(type_tag)
    }

    /// Get all registered type tags
    pub fn type_tags(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    /// Get the number of registered types
    pub fn len(&self) -> usize {
        self.constructors.len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.constructors.is_empty()
    }
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistry")
            .field("type_tags", &self.type_tags())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::{JobFailure, JobOutcome};
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct Greet {
        name: String,
    }

    #[async_trait]
    impl Task for Greet {
        const TYPE_TAG: &'static str = "greet";

        async fn handle(&self, _ctx: &JobContext) -> JobResult {
            if self.name.is_empty() {
                Err(JobFailure::fatal("nobody to greet"))
            } else {
                Ok(JobOutcome::Completed)
            }
        }
    }

    #[tokio::test]
    async fn test_resolve_registered_type() {
        let mut registry = JobRegistry::new();
        registry.register::<Greet>();

        assert!(registry.has_type("greet"));
        assert!(!registry.has_type("unknown"));

        let job = Job::new("greet", json!({"name": "Alice"}));
        let runnable = registry.resolve(&job).unwrap();
        let ctx = JobContext::for_job(&job, "worker-1");
        assert_eq!(runnable.run(&ctx).await, Ok(JobOutcome::Completed));

        let job = Job::new("greet", json!({"name": ""}));
        let runnable = registry.resolve(&job).unwrap();
        assert!(runnable.run(&ctx).await.unwrap_err().is_fatal());
    }

    #[test]
    fn test_resolve_unknown_type() {
        let registry = JobRegistry::new();
        let job = Job::new("greet", json!({"name": "Alice"}));

        assert!(matches!(
            registry.resolve(&job),
            Err(QueueError::UnknownJobType { .. })
        ));
    }

    #[test]
    fn test_resolve_bad_payload() {
        let mut registry = JobRegistry::new();
        registry.register::<Greet>();
        let job = Job::new("greet", json!({"wrong": 1}));

        assert!(matches!(
            registry.resolve(&job),
            Err(QueueError::SerializationError { .. })
        ));
    }
}
