//! Job status management.
//!
//! A stored job is always in one of three states. Successful completion is not
//! a state: an acknowledged job is deleted from its driver.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Represents where a job currently sits in its driver.
///
/// ```text
/// Pending ⇄ Reserved → Dead
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting in the main queue; eligible once `available_at` has passed
    #[default]
    Pending,
    /// Held by a worker until `reserved_until`
    Reserved,
    /// Moved to the dead-letter queue after exhausting its retry budget
    Dead,
}

impl JobStatus {
    /// Returns the name of the status as a string.
    pub fn name(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Reserved => "reserved",
            JobStatus::Dead => "dead",
        }
    }

    /// Checks if this status can transition to the given target status.
    ///
    /// `Reserved → Reserved` is allowed because an expired reservation is
    /// handed to the next worker that asks for it.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        match (self, target) {
            (Pending, Reserved) => true,
            (Reserved, Reserved) => true,
            (Reserved, Pending) => true,
            (Reserved, Dead) => true,

            // Dead entries only leave the DLQ as brand new jobs
            (Dead, _) => false,

            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
