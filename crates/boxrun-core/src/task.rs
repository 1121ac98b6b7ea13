//! Task records and legacy run results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{SandboxId, TaskId};
use crate::status::TaskState;

/// A task as observed on a sandbox daemon.
///
/// The orchestration layer never sets `state` itself; every value comes from
/// a daemon status response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Daemon-assigned task identifier.
    pub id: TaskId,

    /// Sandbox the task runs in.
    pub sandbox_id: SandboxId,

    /// Prompt given to the agent.
    pub prompt: String,

    /// Model requested for the agent.
    pub model: String,

    /// Working directory inside the sandbox.
    pub work_dir: String,

    /// Current state.
    pub state: TaskState,

    /// Daemon status message.
    pub message: String,

    /// When the agent process started.
    pub started_at: Option<DateTime<Utc>>,

    /// When the agent process finished.
    pub finished_at: Option<DateTime<Utc>>,

    /// Exit code of the agent process, once finished.
    pub exit_code: Option<i32>,

    /// Error text for failed tasks.
    pub error: Option<String>,
}

impl TaskRecord {
    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Wall-clock run time, if both timestamps are known.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

/// Aggregated result of the legacy synchronous run path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunOutput {
    /// True when the daemon reported completion with exit code 0.
    pub success: bool,
    /// Concatenated STDOUT fragments.
    pub output: String,
    /// Concatenated STDERR and ERROR fragments.
    pub error: String,
    /// Exit code from the finished marker, if one arrived.
    pub exit_code: Option<i32>,
}
