//! Job definition and management.
//!
//! This module contains the core [`Job`] record: the stored, serializable form
//! of a unit of work. Concrete job types implement
//! [`Task`](crate::processing::Task) and are converted to a [`Job`] at
//! dispatch time; workers rebuild them from the record through the
//! [`JobRegistry`](crate::processing::JobRegistry).
//!
//! ## Job Lifecycle
//!
//! ```text
//! dispatch → Pending → Reserved → (ack: deleted)
//!               ↑          │
//!               └─release──┤
//!                          └─ exhausted → Dead (DLQ)
//! ```
//!
//! ## Examples
//!
//! ```rust
//! use jobwell::Job;
//! use serde_json::json;
//!
//! let job = Job::new("send_email", json!({"to": "user@example.com"}))
//!     .on_queue("mail")
//!     .with_priority(5)
//!     .with_max_attempts(2);
//!
//! let json = job.serialize().unwrap();
//! let restored = Job::deserialize(&json).unwrap();
//! assert_eq!(job.id, restored.id);
//! assert_eq!(restored.queue, "mail");
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use uuid::Uuid;

use crate::core::JobStatus;
use crate::error::{QueueError, Result};
use crate::processing::{Backoff, Task};

/// Queue used when a job does not name one.
pub const DEFAULT_QUEUE: &str = "default";

/// Retry budget used when a job does not configure one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// A stored unit of work.
///
/// ## Fields
///
/// - **`id`**: Unique identifier, (re)assigned by the queue manager on dispatch
/// - **`type_tag`**: Identifies the [`Task`] implementation that handles the job
/// - **`payload`**: The task's own serialized state
/// - **`attempts`**: Number of failed executions so far
/// - **`max_attempts`**: Retries allowed after the first failed execution
/// - **`available_at`**: Earliest time the job may be reserved; only grows
/// - **`reserved_until`**: Set iff `status == Reserved`
/// - **`reservation_token`**: Set iff `status == Reserved`; new on every reservation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier for the job (UUID format)
    pub id: String,

    /// Tag of the [`Task`] implementation, used to rebuild the job from storage
    pub type_tag: String,

    /// The task's serialized fields
    pub payload: Value,

    /// Logical queue the job belongs to
    ///
    /// Default: `"default"`
    pub queue: String,

    /// Job priority (higher values are reserved first)
    pub priority: i32,

    /// Failed executions so far; starts at 0
    pub attempts: u32,

    /// How many times a failed job is retried before it is dead-lettered.
    ///
    /// A job with `max_attempts = 2` runs at most three times.
    pub max_attempts: u32,

    /// Delay function applied between retries
    pub backoff: Backoff,

    /// When the job was created (UTC timestamp)
    pub created_at: DateTime<Utc>,

    /// Earliest moment a worker may reserve the job
    pub available_at: DateTime<Utc>,

    /// Visibility deadline of the current reservation
    pub reserved_until: Option<DateTime<Utc>>,

    /// Identifies the current reservation.
    ///
    /// Ack, release and dead-lettering must present the token handed out by
    /// `reserve`; a reclaimed job carries a new one.
    #[serde(default)]
    pub reservation_token: Option<String>,

    /// Current status of the job
    pub status: JobStatus,

    /// Enqueue order within the driver, used as the final ordering tie-break
    #[serde(default)]
    pub sequence: u64,

    /// Optional producer-supplied idempotency key
    ///
    /// When set, deduplication identifies the job by this key instead of `id`,
    /// so two dispatches of the same logical work are recognised as duplicates.
    #[serde(default)]
    pub unique_key: Option<String>,

    /// Message of the most recent failure
    #[serde(default)]
    pub last_error: Option<String>,

    /// Additional metadata for the job
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Job {
    /// Creates a new job record with default settings:
    /// - Queue: "default"
    /// - Priority: 0
    /// - Max attempts: 3
    /// - Exponential backoff
    pub fn new(type_tag: impl Into<String>, payload: Value) -> Self {
        let now = Utc::now();

        Self {
            id: Uuid::new_v4().to_string(),
            type_tag: type_tag.into(),
            payload,
            queue: DEFAULT_QUEUE.to_string(),
            priority: 0,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Backoff::default(),
            created_at: now,
            available_at: now,
            reserved_until: None,
            reservation_token: None,
            status: JobStatus::Pending,
            sequence: 0,
            unique_key: None,
            last_error: None,
            metadata: HashMap::new(),
        }
    }

    /// Builds a job record from a concrete task.
    ///
    /// The payload must survive `from_payload(to_payload(task))`; a task that
    /// cannot round-trip is rejected here so it never reaches storage.
    pub fn from_task<T: Task>(task: &T) -> Result<Self> {
        let payload = task.to_payload()?;
        T::from_payload(&payload).map_err(|e| QueueError::SerializationError {
            message: format!(
                "payload of '{}' does not round-trip: {}",
                T::TYPE_TAG,
                e
            ),
        })?;

        Ok(Self::new(T::TYPE_TAG, payload)
            .on_queue(task.queue())
            .with_priority(task.priority())
            .with_max_attempts(task.max_attempts())
            .with_backoff(task.backoff()))
    }

    /// Sets the queue name.
    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the retry budget.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the backoff used between retries.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the idempotency key used by deduplication.
    pub fn with_unique_key(mut self, key: impl Into<String>) -> Self {
        self.unique_key = Some(key.into());
        self
    }

    /// Adds metadata to the job.
    pub fn add_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// Serializes the job to a JSON string for storage.
    pub fn serialize(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| QueueError::SerializationError {
            message: format!("Failed to serialize job: {}", e),
        })
    }

    /// Deserializes a job from a JSON string.
    pub fn deserialize(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| QueueError::SerializationError {
            message: format!("Failed to deserialize job: {}", e),
        })
    }

    /// Updates the job's status and validates the transition.
    pub fn set_status(&mut self, status: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(status) {
            return Err(QueueError::InvalidJobData {
                message: format!(
                    "invalid status transition for job {}: {} -> {}",
                    self.id, self.status, status
                ),
            });
        }

        self.status = status;
        Ok(())
    }

    /// Whether a worker may reserve the job at `now`.
    ///
    /// A reservation whose deadline has passed counts as abandoned by a crashed
    /// worker, so the job is eligible again.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Pending => self.available_at <= now,
            JobStatus::Reserved => self.reservation_expired(now),
            JobStatus::Dead => false,
        }
    }

    /// Whether the job is reserved and its visibility deadline has passed.
    pub fn reservation_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Reserved
            && self.reserved_until.is_some_and(|until| until <= now)
    }

    /// Whether the job is held by a live reservation at `now`.
    pub fn is_reserved_at(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Reserved && !self.reservation_expired(now)
    }

    /// Whether `held` is the live reservation of this stored record.
    ///
    /// False once the reservation expired or the job was reserved again.
    pub fn is_held_by(&self, held: &Job, now: DateTime<Utc>) -> bool {
        self.is_reserved_at(now)
            && self.reservation_token.is_some()
            && self.reservation_token == held.reservation_token
    }

    /// Marks the job reserved until `until` under a new reservation token.
    pub fn mark_reserved(&mut self, until: DateTime<Utc>) -> Result<()> {
        self.set_status(JobStatus::Reserved)?;
        self.reserved_until = Some(until);
        self.reservation_token = Some(Uuid::new_v4().to_string());
        Ok(())
    }

    /// Clears reservation state before the record is stored as pending.
    pub fn clear_reservation(&mut self) {
        self.status = JobStatus::Pending;
        self.reserved_until = None;
        self.reservation_token = None;
    }

    /// Returns a reserved job to pending after a failed execution.
    ///
    /// Increments `attempts`. `available_at` never moves backwards.
    pub fn mark_released(&mut self, available_at: DateTime<Utc>) -> Result<()> {
        self.set_status(JobStatus::Pending)?;
        self.reserved_until = None;
        self.reservation_token = None;
        self.attempts += 1;
        if available_at > self.available_at {
            self.available_at = available_at;
        }
        Ok(())
    }

    /// Order in which eligible jobs are handed out: highest priority first,
    /// then earliest `available_at`, then enqueue order.
    pub fn reservation_order(&self, other: &Job) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.available_at.cmp(&other.available_at))
            .then_with(|| self.sequence.cmp(&other.sequence))
    }

    /// Key identifying the logical job for deduplication.
    pub fn dedup_key(&self) -> String {
        let identity = self.unique_key.as_deref().unwrap_or(&self.id);
        format!("{}:{}", self.type_tag, identity)
    }

    /// Creates a fresh copy of the job for re-enqueueing.
    ///
    /// The copy gets a new id, zero attempts and is immediately available.
    /// Payload, queue, priority and retry settings are preserved.
    pub fn fresh_copy(&self) -> Self {
        let now = Utc::now();
        let mut copy = self.clone();
        copy.id = Uuid::new_v4().to_string();
        copy.attempts = 0;
        copy.created_at = now;
        copy.available_at = now;
        copy.clear_reservation();
        copy.sequence = 0;
        copy.last_error = None;
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn test_new_job_defaults() {
        let job = Job::new("report", json!({"month": 4}));

        assert!(!job.id.is_empty());
        assert_eq!(job.queue, DEFAULT_QUEUE);
        assert_eq!(job.priority, 0);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.reserved_until.is_none());
        assert!(job.available_at >= job.created_at);
    }

    #[test]
    fn test_reserve_and_release_cycle() {
        let mut job = Job::new("report", json!({}));
        let now = Utc::now();

        job.mark_reserved(now + Duration::seconds(30)).unwrap();
        assert_eq!(job.status, JobStatus::Reserved);
        assert!(job.is_reserved_at(now));
        assert!(!job.is_eligible(now));

        job.mark_released(now + Duration::seconds(5)).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        assert!(job.reserved_until.is_none());
        assert!(!job.is_eligible(now));
        assert!(job.is_eligible(now + Duration::seconds(5)));
    }

    #[test]
    fn test_reservation_token_changes_on_reclaim() {
        let mut stored = Job::new("report", json!({}));
        let now = Utc::now();

        stored.mark_reserved(now - Duration::seconds(1)).unwrap();
        let stale = stored.clone();
        assert!(!stored.is_held_by(&stale, now));

        stored.mark_reserved(now + Duration::seconds(30)).unwrap();
        let live = stored.clone();
        assert_ne!(stale.reservation_token, live.reservation_token);
        assert!(stored.is_held_by(&live, now));
        assert!(!stored.is_held_by(&stale, now));

        stored.mark_released(now).unwrap();
        assert!(stored.reservation_token.is_none());
        assert!(!stored.is_held_by(&live, now));
    }

    #[test]
    fn test_available_at_never_moves_backwards() {
        let mut job = Job::new("report", json!({}));
        let later = Utc::now() + Duration::seconds(60);
        job.available_at = later;

        job.mark_reserved(Utc::now()).unwrap();
        job.mark_released(Utc::now()).unwrap();

        assert_eq!(job.available_at, later);
    }

    #[test]
    fn test_expired_reservation_is_eligible() {
        let mut job = Job::new("report", json!({}));
        let now = Utc::now();
        job.mark_reserved(now - Duration::seconds(1)).unwrap();

        assert!(job.reservation_expired(now));
        assert!(job.is_eligible(now));
        assert!(!job.is_reserved_at(now));
    }

    #[test]
    fn test_release_requires_reservation() {
        let mut job = Job::new("report", json!({}));
        assert!(job.mark_released(Utc::now()).is_err());
        assert_eq!(job.attempts, 0);
    }

    #[test]
    fn test_reservation_order() {
        let now = Utc::now();
        let mut low = Job::new("report", json!({}));
        low.sequence = 1;
        low.available_at = now - Duration::seconds(10);
        let mut high = Job::new("report", json!({})).with_priority(5);
        high.sequence = 2;
        high.available_at = now;

        assert_eq!(high.reservation_order(&low), Ordering::Less);

        let mut later = low.clone();
        later.sequence = 3;
        assert_eq!(low.reservation_order(&later), Ordering::Less);
    }

    #[test]
    fn test_dedup_key_prefers_unique_key() {
        let job = Job::new("report", json!({}));
        assert_eq!(job.dedup_key(), format!("report:{}", job.id));

        let keyed = job.with_unique_key("april");
        assert_eq!(keyed.dedup_key(), "report:april");
    }

    #[test]
    fn test_fresh_copy_resets_attempts() {
        let mut job = Job::new("report", json!({"month": 4})).with_priority(7);
        job.attempts = 3;
        job.last_error = Some("boom".to_string());

        let copy = job.fresh_copy();
        assert_ne!(copy.id, job.id);
        assert_eq!(copy.attempts, 0);
        assert_eq!(copy.payload, job.payload);
        assert_eq!(copy.priority, 7);
        assert!(copy.last_error.is_none());
    }
}
