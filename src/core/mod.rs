//! Core types for jobwell.
//!
//! This module contains the stored job record, its status and the
//! dead-letter snapshot.

pub mod dead_letter_entry;
pub mod job;
pub mod job_status;

pub use dead_letter_entry::DeadLetterEntry;
pub use job::{DEFAULT_MAX_ATTEMPTS, DEFAULT_QUEUE, Job};
pub use job_status::JobStatus;
