//! Job-scoped middleware pipeline.
//!
//! Middleware wraps the execution of a single job. The first middleware added
//! to a [`MiddlewarePipeline`] is the outermost layer: it sees the job first
//! and the result last. A middleware may short-circuit by returning without
//! calling [`Next::run`].

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::{JobContext, JobFailure, JobOutcome, JobRegistry, JobResult};
use crate::core::Job;

/// A layer around job execution.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Handle the job, usually by calling `next.run(job, ctx)` somewhere inside.
    async fn handle(&self, job: &Job, ctx: &JobContext, next: Next<'_>) -> JobResult;
}

/// The remainder of the pipeline, ending in the job's handler.
pub struct Next<'a> {
    middlewares: &'a [Arc<dyn Middleware>],
    registry: &'a JobRegistry,
}

impl<'a> Next<'a> {
    /// Continue with the next layer.
    pub fn run(self, job: &'a Job, ctx: &'a JobContext) -> BoxFuture<'a, JobResult> {
        Box::pin(async move {
            match self.middlewares.split_first() {
                Some((current, rest)) => {
                    let next = Next {
                        middlewares: rest,
                        registry: self.registry,
                    };
                    current.handle(job, ctx, next).await
                }
                None => {
                    // Unknown tags and undecodable payloads never succeed on retry
                    let runnable = self
                        .registry
                        .resolve(job)
                        .map_err(|e| JobFailure::fatal(e.to_string()))?;
                    runnable.run(ctx).await
                }
            }
        })
    }
}

/// Ordered list of middleware applied to every job a worker executes.
#[derive(Clone, Default)]
pub struct MiddlewarePipeline {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl MiddlewarePipeline {
    /// Create an empty pipeline
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a middleware; it wraps everything added after it.
    pub fn add<M: Middleware + 'static>(&mut self, middleware: M) -> &mut Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    /// Append a shared middleware.
    pub fn add_shared(&mut self, middleware: Arc<dyn Middleware>) -> &mut Self {
        self.middlewares.push(middleware);
        self
    }

    /// Builder form of [`add`](Self::add).
    pub fn with<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.add(middleware);
        self
    }

    /// Run `job` through every layer and then its handler.
    pub async fn execute(&self, job: &Job, ctx: &JobContext, registry: &JobRegistry) -> JobResult {
        let next = Next {
            middlewares: &self.middlewares,
            registry,
        };
        next.run(job, ctx).await
    }

    /// Names of the layers, outermost first
    pub fn names(&self) -> Vec<&str> {
        self.middlewares.iter().map(|m| m.name()).collect()
    }

    /// Get the number of layers
    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    /// Check if the pipeline is empty
    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }
}

impl fmt::Debug for MiddlewarePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewarePipeline")
            .field("middlewares", &self.names())
            .finish()
    }
}

/// Skips jobs whose dedup key is running or completed recently.
///
/// A job is identified by [`Job::dedup_key`]: its type tag plus either its
/// `unique_key` or its id. A key is claimed before the handler runs, in the
/// same critical section as the duplicate check, so two workers running the
/// same key at once execute it only once. The claim becomes a completion
/// record on success and is dropped otherwise, so failed executions are
/// retried normally.
///
/// Keys live in this middleware instance; workers in other processes are not
/// covered.
pub struct DedupMiddleware {
    window: Duration,
    keys: Mutex<HashMap<String, KeyState>>,
}

#[derive(Debug, Clone, Copy)]
enum KeyState {
    Running,
    Completed(DateTime<Utc>),
}

impl DedupMiddleware {
    /// Remember completed keys for `window`.
    pub fn new(window: std::time::Duration) -> Self {
        Self {
            window: Duration::from_std(window).unwrap_or(Duration::MAX),
            keys: Mutex::new(HashMap::new()),
        }
    }

    fn keys(&self) -> MutexGuard<'_, HashMap<String, KeyState>> {
        self.keys.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Whether `key` is running or completed inside the window.
    pub fn is_duplicate(&self, key: &str) -> bool {
        let now = Utc::now();
        let mut keys = self.keys();
        self.prune(&mut keys, now);
        keys.contains_key(key)
    }

    /// Claim `key` unless it is a duplicate.
    fn claim(&self, key: &str) -> Option<Claim<'_>> {
        let now = Utc::now();
        let mut keys = self.keys();
        self.prune(&mut keys, now);
        if keys.contains_key(key) {
            return None;
        }
        keys.insert(key.to_string(), KeyState::Running);
        Some(Claim {
            dedup: self,
            key: Some(key.to_string()),
        })
    }

    fn prune(&self, keys: &mut HashMap<String, KeyState>, now: DateTime<Utc>) {
        keys.retain(|_, state| match state {
            KeyState::Running => true,
            KeyState::Completed(at) => now - *at < self.window,
        });
    }
}

/// A running key; released on drop unless completed.
struct Claim<'a> {
    dedup: &'a DedupMiddleware,
    key: Option<String>,
}

impl Claim<'_> {
    fn complete(mut self) {
        if let Some(key) = self.key.take() {
            self.dedup
                .keys()
                .insert(key, KeyState::Completed(Utc::now()));
        }
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.dedup.keys().remove(&key);
        }
    }
}

impl Default for DedupMiddleware {
    fn default() -> Self {
        Self::new(std::time::Duration::from_secs(60 * 60))
    }
}

#[async_trait]
impl Middleware for DedupMiddleware {
    fn name(&self) -> &str {
        "dedup"
    }

    async fn handle(&self, job: &Job, ctx: &JobContext, next: Next<'_>) -> JobResult {
        let key = job.dedup_key();

        let Some(claim) = self.claim(&key) else {
            debug!("Skipping duplicate job {} ({})", job.id, key);
            return Ok(JobOutcome::skipped(format!("duplicate of {}", key)));
        };

        let result = next.run(job, ctx).await;
        if matches!(result, Ok(JobOutcome::Completed)) {
            claim.complete();
        }
        result
    }
}

/// Logs the start and end of every execution.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &str {
        "logging"
    }

    async fn handle(&self, job: &Job, ctx: &JobContext, next: Next<'_>) -> JobResult {
        info!(
            job_id = %job.id,
            type_tag = %job.type_tag,
            queue = %job.queue,
            attempt = ctx.attempt,
            "Starting job"
        );

        let result = next.run(job, ctx).await;
        let elapsed_ms = ctx.elapsed().num_milliseconds();

        match &result {
            Ok(JobOutcome::Completed) => {
                info!(job_id = %job.id, elapsed_ms, "Job completed");
            }
            Ok(JobOutcome::Skipped { reason }) => {
                info!(job_id = %job.id, %reason, "Job skipped");
            }
            Err(failure) => {
                warn!(job_id = %job.id, elapsed_ms, error = %failure, "Job failed");
            }
        }

        result
    }
}

/// Injects fixed metadata into the context seen by inner layers.
#[derive(Debug, Default, Clone)]
pub struct ContextMiddleware {
    values: HashMap<String, String>,
}

impl ContextMiddleware {
    /// Create an empty context middleware
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value to inject
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }
}

#[async_trait]
impl Middleware for ContextMiddleware {
    fn name(&self) -> &str {
        "context"
    }

    async fn handle(&self, job: &Job, ctx: &JobContext, next: Next<'_>) -> JobResult {
        let mut ctx = ctx.clone();
        for (key, value) in &self.values {
            ctx.add_metadata(key.clone(), value.clone());
        }
        next.run(job, &ctx).await
    }
}
