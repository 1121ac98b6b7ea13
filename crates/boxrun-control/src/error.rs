//! Control plane errors.

use std::path::PathBuf;

use thiserror::Error;

use boxrun_core::CoreError;

use crate::cloud::CloudError;
use crate::runtime::RuntimeError;
use crate::store::StoreError;

/// Stable classification of a [`ControlError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ValidationFailed,
    SandboxNotFound,
    ProviderUnavailable,
    DaemonUnavailable,
    TaskInvalid,
    ApiKeyMissing,
    SystemUnavailable,
    StoreLocked,
    Store,
    Rpc,
}

/// Errors surfaced by control plane operations.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Request rejected before any I/O.
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// No sandbox matches the given name or id.
    #[error("Sandbox not found: {0}")]
    SandboxNotFound(String),

    /// Container runtime or cloud provider failed.
    #[error("Provider unavailable while {step}: {reason}")]
    ProviderUnavailable { step: &'static str, reason: String },

    /// Could not reach the sandbox daemon.
    #[error("Daemon unavailable at {endpoint}: {reason}")]
    DaemonUnavailable { endpoint: String, reason: String },

    /// Task rejected by the daemon or observed in an impossible state.
    #[error("Invalid task: {0}")]
    TaskInvalid(String),

    /// No agent credentials found.
    #[error("No API key found: set ANTHROPIC_API_KEY or add it to ~/.config/boxrun/credentials")]
    ApiKeyMissing,

    /// Path that exists in the interface but is not implemented.
    #[error("Not supported: {0}")]
    SystemUnavailable(String),

    /// Local store held by another process past the retry budget.
    #[error("Local store {} is locked by another process (gave up after {attempts} attempts)", path.display())]
    StoreLocked { path: PathBuf, attempts: u32 },

    /// Local store I/O failure.
    #[error("Local store error: {0}")]
    Store(String),

    /// Daemon answered the call with an error.
    #[error("Daemon call {step} failed: {status}")]
    Rpc {
        step: &'static str,
        status: tonic::Status,
    },
}

impl ControlError {
    /// Stable kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ValidationFailed(_) => ErrorKind::ValidationFailed,
            Self::SandboxNotFound(_) => ErrorKind::SandboxNotFound,
            Self::ProviderUnavailable { .. } => ErrorKind::ProviderUnavailable,
            Self::DaemonUnavailable { .. } => ErrorKind::DaemonUnavailable,
            Self::TaskInvalid(_) => ErrorKind::TaskInvalid,
            Self::ApiKeyMissing => ErrorKind::ApiKeyMissing,
            Self::SystemUnavailable(_) => ErrorKind::SystemUnavailable,
            Self::StoreLocked { .. } => ErrorKind::StoreLocked,
            Self::Store(_) => ErrorKind::Store,
            Self::Rpc { .. } => ErrorKind::Rpc,
        }
    }

    /// Wrap a cloud provider failure with the step it happened in.
    pub fn cloud(step: &'static str, err: CloudError) -> Self {
        match err {
            CloudError::NotFound(what) => Self::SandboxNotFound(what),
            CloudError::BadRequest(msg) => Self::ValidationFailed(msg),
            other => Self::ProviderUnavailable {
                step,
                reason: other.to_string(),
            },
        }
    }

    /// Wrap a container runtime failure with the step it happened in.
    pub fn runtime(step: &'static str, err: RuntimeError) -> Self {
        match err {
            RuntimeError::NotFound(what) => Self::SandboxNotFound(what),
            other => Self::ProviderUnavailable {
                step,
                reason: other.to_string(),
            },
        }
    }

    /// Wrap a daemon RPC failure.
    pub fn rpc(step: &'static str, status: tonic::Status) -> Self {
        Self::Rpc { step, status }
    }
}

impl From<StoreError> for ControlError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Locked { path, attempts } => Self::StoreLocked { path, attempts },
            StoreError::DuplicateName(name) => {
                Self::ValidationFailed(format!("sandbox name '{name}' already exists"))
            }
            StoreError::NotFound(key) => Self::SandboxNotFound(key),
            other => Self::Store(other.to_string()),
        }
    }
}

impl From<CoreError> for ControlError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidInput(msg) => Self::ValidationFailed(msg),
            other => Self::TaskInvalid(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_lock_maps_to_locked_kind() {
        let err: ControlError = StoreError::Locked {
            path: PathBuf::from("/tmp/x"),
            attempts: 3,
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::StoreLocked);
        assert!(err.to_string().contains("locked"));
    }

    #[test]
    fn test_cloud_errors_classified() {
        assert_eq!(
            ControlError::cloud("listing", CloudError::NotFound("x".into())).kind(),
            ErrorKind::SandboxNotFound
        );
        assert_eq!(
            ControlError::cloud("listing", CloudError::Auth("bad key".into())).kind(),
            ErrorKind::ProviderUnavailable
        );
        assert_eq!(
            ControlError::cloud("creating", CloudError::BadRequest("cpu".into())).kind(),
            ErrorKind::ValidationFailed
        );
    }

    #[test]
    fn test_core_errors_classified() {
        let err: ControlError = CoreError::InvalidInput("name required".into()).into();
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);

        let err: ControlError = CoreError::InvalidStateTransition {
            from: "COMPLETED".into(),
            to: "RUNNING".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::TaskInvalid);
    }
}
