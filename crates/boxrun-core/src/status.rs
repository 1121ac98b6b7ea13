//! Status enums for tasks, sandbox locality, and log classification.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// Lifecycle state of a task running inside a sandbox daemon.
///
/// States only move forward: `Pending -> Running -> {Completed | Failed}`.
/// A task may also fail straight from `Pending` (e.g. the agent binary could
/// not be spawned) or complete before a `Running` observation was made.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Task accepted by the daemon but not started.
    #[default]
    Pending,
    /// Agent process is executing.
    Running,
    /// Agent exited successfully.
    Completed,
    /// Agent exited with an error or could not start.
    Failed,
}

impl TaskState {
    /// Returns true if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Completed | Self::Failed => 2,
        }
    }

    /// Validate an observed transition from `self` to `next`.
    ///
    /// Repeating the current state is allowed (polling sees the same state
    /// many times). Moving backwards, or from one terminal state to the
    /// other, is rejected.
    pub fn advance(self, next: TaskState) -> Result<TaskState, CoreError> {
        if self == next {
            return Ok(next);
        }
        if self.is_terminal() || next.rank() < self.rank() {
            return Err(CoreError::InvalidStateTransition {
                from: self.to_string(),
                to: next.to_string(),
            });
        }
        Ok(next)
    }

    /// Wire name used in status strings and CLI output.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            _ => Err(CoreError::UnknownValue {
                kind: "task state",
                value: s.to_string(),
            }),
        }
    }
}

/// Where a sandbox lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Locality {
    /// A container on this machine.
    Local,
    /// A cloud-hosted instance.
    Remote,
}

impl Locality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

impl fmt::Display for Locality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Locality {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "remote" | "cloud" => Ok(Self::Remote),
            _ => Err(CoreError::UnknownValue {
                kind: "locality",
                value: s.to_string(),
            }),
        }
    }
}

/// Classification of a log event emitted by a daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogEventType {
    /// Agent standard output.
    Stdout,
    /// Agent standard error.
    Stderr,
    /// Lifecycle notice from the daemon.
    Status,
    /// Daemon or transport error.
    Error,
}

impl LogEventType {
    /// Returns true for error-class output (STDERR or ERROR).
    pub fn is_error_output(&self) -> bool {
        matches!(self, LogEventType::Stderr | LogEventType::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "STDOUT",
            Self::Stderr => "STDERR",
            Self::Status => "STATUS",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions() {
        assert_eq!(
            TaskState::Pending.advance(TaskState::Running),
            Ok(TaskState::Running)
        );
        assert_eq!(
            TaskState::Running.advance(TaskState::Completed),
            Ok(TaskState::Completed)
        );
        assert_eq!(
            TaskState::Pending.advance(TaskState::Failed),
            Ok(TaskState::Failed)
        );
        assert_eq!(
            TaskState::Running.advance(TaskState::Running),
            Ok(TaskState::Running)
        );
    }

    #[test]
    fn test_regressions_rejected() {
        assert!(TaskState::Completed.advance(TaskState::Running).is_err());
        assert!(TaskState::Running.advance(TaskState::Pending).is_err());
        assert!(TaskState::Completed.advance(TaskState::Failed).is_err());
        assert!(TaskState::Failed.advance(TaskState::Completed).is_err());
    }

    #[test]
    fn test_task_state_parse() {
        assert_eq!("completed".parse::<TaskState>(), Ok(TaskState::Completed));
        assert!("CANCELLED".parse::<TaskState>().is_err());
    }

    #[test]
    fn test_locality_parse() {
        assert_eq!("local".parse::<Locality>(), Ok(Locality::Local));
        assert_eq!("Remote".parse::<Locality>(), Ok(Locality::Remote));
        assert!("moon".parse::<Locality>().is_err());
    }
}
