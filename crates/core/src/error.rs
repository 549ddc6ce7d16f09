//! Worker error model.

use thiserror::Error;

/// Result type returned by workers.
pub type WorkerResult<T> = Result<T, WorkerError>;

/// Failure of a single job invocation.
///
/// `Unavailable` means no worker could be resolved for a name; it is distinct
/// from a worker that ran and failed (`InvalidArgument` / `Failed`).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// The workload is missing a required key or a value has the wrong shape.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The worker ran and reported a failure.
    #[error("worker failed: {0}")]
    Failed(String),

    /// No worker is registered under the requested name.
    #[error("no worker registered for `{0}`")]
    Unavailable(String),
}

impl WorkerError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    pub fn unavailable(worker_name: impl Into<String>) -> Self {
        Self::Unavailable(worker_name.into())
    }
}
