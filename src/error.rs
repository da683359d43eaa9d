//! Error types surfaced to the orchestrating caller.
//!
//! Collaborators (container client, endpoint, archive store) report
//! `anyhow::Error`s; the executor and the version preparer wrap them into
//! [`ExecutorError`] together with the identity of what failed.

use crate::executor::ExecutorStatus;

pub type Result<T> = std::result::Result<T, ExecutorError>;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ExecutorError {
    #[error("unsupported runtime '{runtime}'")]
    UnsupportedRuntime { runtime: String },

    #[error("executor '{executor_id}' is not running, its address is unknown")]
    NotReady { executor_id: String },

    #[error("executor '{executor_id}' is in state {state}")]
    InvalidState {
        executor_id: String,
        state: ExecutorStatus,
    },

    #[error("failed to prepare '{function}' (revision {revision}): {source:#}")]
    PrepareFailed {
        function: String,
        revision: u64,
        source: anyhow::Error,
    },

    #[error("failed to start executor '{executor_id}' for '{function}': {source:#}")]
    StartFailed {
        executor_id: String,
        function: String,
        source: anyhow::Error,
    },

    #[error("failed to send invocation to executor '{executor_id}': {source:#}")]
    InvokeFailed {
        executor_id: String,
        source: anyhow::Error,
    },

    #[error("failed to stop executor '{executor_id}': {source:#}")]
    StopFailed {
        executor_id: String,
        source: anyhow::Error,
    },

    #[error("failed to clean up '{function}' (revision {revision}): {source:#}")]
    CleanupFailed {
        function: String,
        revision: u64,
        source: anyhow::Error,
    },
}

impl ExecutorError {
    /// Errors raised because the caller used the executor out of order,
    /// as opposed to a failing collaborator.
    pub fn is_misuse(&self) -> bool {
        matches!(self, Self::NotReady { .. } | Self::InvalidState { .. })
    }
}
