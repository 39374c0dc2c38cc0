//! Error taxonomy shared by the job system.

use std::time::Duration;

use crate::job::{ErrorClass, JobError, JobId};
use crate::store::StoreError;

/// Errors surfaced by the job service API.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobsError {
    /// Malformed input, rejected before anything is persisted.
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Duplicate worker id, schedule name collision, ...
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    #[error("Job {job_id} timed out after {timeout:?}")]
    Timeout { job_id: JobId, timeout: Duration },

    /// The caller no longer holds the lease on the job.
    #[error("Lease on job {0} expired")]
    LeaseExpired(JobId),

    #[error("Job service is not initialized")]
    NotInitialized,

    #[error("Store error: {0}")]
    Store(String),

    #[error("Actor error: {0}")]
    Actor(String),
}

impl JobsError {
    pub fn validation(message: impl Into<String>) -> Self {
        JobsError::Validation(message.into())
    }

    pub fn not_found(kind: &'static str, id: impl std::fmt::Display) -> Self {
        JobsError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        JobsError::Conflict(message.into())
    }
}

impl From<StoreError> for JobsError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(id) => JobsError::not_found("Job", id),
            StoreError::LeaseLost(id) => JobsError::LeaseExpired(id),
            StoreError::Duplicate(id) => JobsError::conflict(format!("Job {id} already exists")),
            mismatch @ StoreError::StatusMismatch { .. } => {
                JobsError::conflict(mismatch.to_string())
            }
            other => JobsError::Store(other.to_string()),
        }
    }
}

/// Error returned by a job handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    pub class: ErrorClass,
}

impl HandlerError {
    /// A transient failure worth retrying.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            class: ErrorClass::Retryable,
        }
    }

    /// A failure that retrying cannot fix.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            class: ErrorClass::NonRetryable,
        }
    }

    /// The handler stopped because its cancellation token fired.
    pub fn cancelled() -> Self {
        Self {
            message: "cancelled".into(),
            class: ErrorClass::Cancelled,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class.is_retryable()
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        HandlerError::retryable(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        HandlerError::retryable(message)
    }
}

impl From<HandlerError> for JobError {
    fn from(error: HandlerError) -> Self {
        JobError::new(error.message, error.class)
    }
}
