//! Pool and job error types.

use thiserror::Error;

/// Misuse of a [`BoundedTaskPool`](crate::BoundedTaskPool).
///
/// These are returned synchronously to the caller. Job failures never
/// surface here; see [`JobError`].
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("invalid pool capacity {0}: must be at least 1")]
    InvalidCapacity(usize),

    #[error("pool used after completion")]
    Completed,

    #[error("no tokio runtime available: {0}")]
    NoRuntime(String),
}

/// Why a single job did not succeed.
///
/// Caught at the pool boundary, logged, and handed to the job's completion
/// callback. Never propagated to `flush`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("job failed: {0}")]
    Failed(String),

    #[error("job panicked: {0}")]
    Panicked(String),

    /// The runtime discarded the job's task before it finished.
    #[error("job dropped before completion")]
    Dropped,
}

impl JobError {
    /// Build a [`JobError::Panicked`] from a caught panic payload.
    pub(crate) fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::Panicked(message)
    }
}
