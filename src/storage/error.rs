use crate::error::QueueError;
use thiserror::Error;

/// Driver-level errors raised while persisting or claiming jobs
#[derive(Error, Debug)]
pub enum StorageError {
    /// Connection-related errors (network, authentication, etc.)
    #[error("Storage connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Serialization/deserialization errors when converting jobs to/from storage format
    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Job not found in the driver
    #[error("Job not found: {job_id}")]
    JobNotFound { job_id: String },

    /// Storage operation timed out
    #[error("Storage operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The caller's reservation expired or the job was reserved again
    #[error("Reservation of job {job_id} is no longer held")]
    ReservationLost { job_id: String },

    /// Configuration errors
    #[error("Storage configuration error: {message}")]
    Configuration { message: String },

    /// General storage operation errors
    #[error("Storage operation failed: {operation} - {message}")]
    OperationFailed {
        operation: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Storage capacity exceeded
    #[error("Storage capacity exceeded: {message}")]
    CapacityExceeded { message: String },

    /// Filesystem errors from the file driver
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    /// Create a connection error with a message and source error
    pub fn connection_with_source<S: Into<String>>(
        message: S,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a serialization error with a message and source error
    pub fn serialization_with_source<S: Into<String>>(
        message: S,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::Serialization {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a job not found error
    pub fn job_not_found<S: Into<String>>(job_id: S) -> Self {
        Self::JobNotFound {
            job_id: job_id.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Create a lost reservation error
    pub fn reservation_lost<S: Into<String>>(job_id: S) -> Self {
        Self::ReservationLost {
            job_id: job_id.into(),
        }
    }

    /// Check if the caller no longer holds the job
    pub fn is_reservation_lost(&self) -> bool {
        matches!(self, Self::ReservationLost { .. })
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an operation failed error
    pub fn operation_failed<S: Into<String>, T: Into<String>>(operation: S, message: T) -> Self {
        Self::OperationFailed {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create an operation failed error with source
    pub fn operation_failed_with_source<S: Into<String>, T: Into<String>>(
        operation: S,
        message: T,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::OperationFailed {
            operation: operation.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a capacity exceeded error
    pub fn capacity_exceeded<S: Into<String>>(message: S) -> Self {
        Self::CapacityExceeded {
            message: message.into(),
        }
    }

    /// Wrap a filesystem error with the path it happened on
    pub fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    /// Lock poisoning inside an in-process driver
    pub(crate) fn poisoned(operation: &str) -> Self {
        Self::operation_failed(operation, "driver lock poisoned")
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::serialization_with_source("invalid job record", Box::new(err))
    }
}

// Convert StorageError to QueueError for unified error handling
impl From<StorageError> for QueueError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::JobNotFound { job_id } => QueueError::JobNotFound { job_id },
            StorageError::ReservationLost { job_id } => QueueError::ReservationLost { job_id },
            StorageError::Serialization { message, .. } => {
                QueueError::SerializationError { message }
            }
            StorageError::Configuration { message } => QueueError::ConfigurationError { message },
            _ => QueueError::DriverError {
                message: err.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversion_to_queue_error() {
        let err: QueueError = StorageError::job_not_found("abc").into();
        assert_eq!(
            err,
            QueueError::JobNotFound {
                job_id: "abc".to_string()
            }
        );

        let err: QueueError = StorageError::reservation_lost("abc").into();
        assert_eq!(
            err,
            QueueError::ReservationLost {
                job_id: "abc".to_string()
            }
        );

        let err: QueueError = StorageError::capacity_exceeded("full").into();
        assert!(matches!(err, QueueError::DriverError { .. }));
        assert!(err.to_string().contains("full"));
    }
}
