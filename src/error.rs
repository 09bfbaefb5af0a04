//! Error types for jobwell.
//!
//! Producer-facing failures (serialization, driver availability at dispatch)
//! surface as [`QueueError`]. Failures raised by job handlers never become a
//! `QueueError` inside the worker; they are reported as
//! [`JobFailure`](crate::processing::JobFailure) and routed through the retry
//! policy instead.

use thiserror::Error;

/// The main error type for queue operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueueError {
    /// The job payload could not be serialized or did not survive a round trip.
    #[error("Serialization failed: {message}")]
    SerializationError { message: String },

    /// The storage backend rejected the operation or is unreachable.
    #[error("Driver error: {message}")]
    DriverError { message: String },

    /// Job not found in the driver or dead-letter store
    #[error("Job not found: {job_id}")]
    JobNotFound { job_id: String },

    /// A worker settled a job whose reservation it no longer holds
    #[error("Reservation lost for job {job_id}")]
    ReservationLost { job_id: String },

    /// No constructor registered for a type tag
    #[error("Unknown job type: {type_tag}")]
    UnknownJobType { type_tag: String },

    /// A job executed inline (synchronous driver) failed.
    #[error("Job {job_id} failed: {message}")]
    HandlerFailed { job_id: String, message: String },

    /// Invalid job data
    #[error("Invalid job data: {message}")]
    InvalidJobData { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    /// `use_driver` was called with a name that was never registered.
    #[error("Driver not registered: {name}")]
    DriverNotRegistered { name: String },
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::SerializationError {
            message: err.to_string(),
        }
    }
}

impl From<uuid::Error> for QueueError {
    fn from(err: uuid::Error) -> Self {
        QueueError::InvalidJobData {
            message: format!("UUID error: {}", err),
        }
    }
}

/// A specialized Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;
