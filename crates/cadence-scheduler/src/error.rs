//! Error types for the scheduler.

use thiserror::Error;

use crate::trigger::TriggerError;

/// Errors that can occur in scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Job not found.
    #[error("job not found: {0}")]
    NotFound(String),

    /// Job already exists.
    #[error("job already exists: {0}")]
    JobExists(String),

    /// Malformed or unsatisfiable trigger configuration.
    #[error("invalid trigger: {0}")]
    InvalidTrigger(#[from] TriggerError),

    /// Invalid job configuration.
    #[error("invalid job configuration: {0}")]
    InvalidConfig(String),

    /// The job is already running `max_instances` times.
    #[error("job {job_id} is busy ({running} of {max_instances} instances running)")]
    Busy {
        job_id: String,
        running: u32,
        max_instances: u32,
    },

    /// No job body is registered under this function id.
    #[error("unknown function: {0}")]
    UnknownFunction(String),

    /// Inline code was submitted but no sandbox is available to run it.
    #[error("sandbox unavailable: {0}")]
    Sandbox(String),
}

impl SchedulerError {
    /// Whether this error is a [`SchedulerError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
