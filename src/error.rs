use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::ledger::Credits;
use crate::scheduler::JobStatus;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Insufficient credits. Required: {required}, Available: {available}")]
    InsufficientCredits {
        required: Credits,
        available: Credits,
    },

    #[error("Job queue is full ({0} active jobs)")]
    QueueFull(usize),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Storage write timed out after {0:?}")]
    StorageTimeout(Duration),

    #[error("Coordinator is degraded until reconciled with the durable store")]
    Degraded,
}

impl CoordinatorError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CoordinatorError::WorkerNotFound(_)
                | CoordinatorError::JobNotFound(_)
                | CoordinatorError::AccountNotFound(_)
        )
    }

    pub fn storage(message: impl Into<String>) -> Self {
        CoordinatorError::Storage(message.into())
    }
}

impl From<std::io::Error> for CoordinatorError {
    fn from(e: std::io::Error) -> Self {
        CoordinatorError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for CoordinatorError {
    fn from(e: serde_json::Error) -> Self {
        CoordinatorError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;
