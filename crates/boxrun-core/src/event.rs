//! Log events relayed from sandbox daemons.

use serde::{Deserialize, Serialize};

use crate::status::{LogEventType, TaskState};

/// One fragment of task output or a lifecycle notice.
///
/// `content` is whatever the daemon read from the agent; it is not
/// necessarily a complete line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    /// Classification of the fragment.
    pub event_type: LogEventType,
    /// Raw content.
    pub content: String,
    /// Unix timestamp (milliseconds) when the daemon recorded the event.
    pub timestamp_ms: i64,
    /// Set on the final event of a task.
    pub task_completed: bool,
    /// Terminal status string accompanying `task_completed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_status: Option<String>,
}

impl LogEvent {
    /// Create a new event stamped with the current time.
    pub fn new(event_type: LogEventType, content: impl Into<String>) -> Self {
        Self {
            event_type,
            content: content.into(),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            task_completed: false,
            task_status: None,
        }
    }

    /// Create a STDOUT event.
    pub fn stdout(content: impl Into<String>) -> Self {
        Self::new(LogEventType::Stdout, content)
    }

    /// Create a STDERR event.
    pub fn stderr(content: impl Into<String>) -> Self {
        Self::new(LogEventType::Stderr, content)
    }

    /// Create the terminal STATUS event for a finished task.
    pub fn completed(state: TaskState, content: impl Into<String>) -> Self {
        Self {
            task_completed: true,
            task_status: Some(state.to_string()),
            ..Self::new(LogEventType::Status, content)
        }
    }

    /// Create the synthetic ERROR event used when a stream breaks.
    pub fn transport_error(description: impl Into<String>) -> Self {
        Self::new(LogEventType::Error, description)
    }
}
