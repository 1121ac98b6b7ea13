//! Daemon error types.

use thiserror::Error;

/// Errors raised while running tasks inside the daemon.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// The agent process could not be spawned.
    #[error("Failed to spawn agent '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Waiting on the agent process failed.
    #[error("Failed to wait for agent process: {0}")]
    Wait(#[source] std::io::Error),

    /// Request rejected before a task was created.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Unknown task id.
    #[error("Task not found: {0}")]
    TaskNotFound(String),
}

impl From<DaemonError> for tonic::Status {
    fn from(err: DaemonError) -> Self {
        match err {
            DaemonError::InvalidRequest(msg) => tonic::Status::invalid_argument(msg),
            DaemonError::TaskNotFound(id) => {
                tonic::Status::not_found(format!("Task not found: {id}"))
            }
            other => tonic::Status::internal(other.to_string()),
        }
    }
}
