//! Converters between proto types and domain types.

use chrono::{DateTime, TimeZone, Utc};

use crate::pb;
use boxrun_core::{CoreError, LogEvent, LogEventType, SandboxId, TaskId, TaskRecord, TaskState};

// ============================================================================
// TaskState conversions
// ============================================================================

impl From<TaskState> for pb::TaskState {
    fn from(state: TaskState) -> Self {
        match state {
            TaskState::Pending => pb::TaskState::Pending,
            TaskState::Running => pb::TaskState::Running,
            TaskState::Completed => pb::TaskState::Completed,
            TaskState::Failed => pb::TaskState::Failed,
        }
    }
}

impl TryFrom<pb::TaskState> for TaskState {
    type Error = CoreError;

    fn try_from(state: pb::TaskState) -> Result<Self, Self::Error> {
        match state {
            pb::TaskState::Pending => Ok(TaskState::Pending),
            pb::TaskState::Running => Ok(TaskState::Running),
            pb::TaskState::Completed => Ok(TaskState::Completed),
            pb::TaskState::Failed => Ok(TaskState::Failed),
            pb::TaskState::Unspecified => Err(CoreError::UnknownValue {
                kind: "task state",
                value: "UNSPECIFIED".to_string(),
            }),
        }
    }
}

/// Map a raw wire value to a domain state.
pub fn task_state_from_i32(value: i32) -> Result<TaskState, CoreError> {
    let state = pb::TaskState::try_from(value).map_err(|_| CoreError::UnknownValue {
        kind: "task state",
        value: value.to_string(),
    })?;
    TaskState::try_from(state)
}

// ============================================================================
// LogEventType conversions
// ============================================================================

impl From<LogEventType> for pb::LogType {
    fn from(event_type: LogEventType) -> Self {
        match event_type {
            LogEventType::Stdout => pb::LogType::Stdout,
            LogEventType::Stderr => pb::LogType::Stderr,
            LogEventType::Status => pb::LogType::Status,
            LogEventType::Error => pb::LogType::Error,
        }
    }
}

impl From<pb::LogType> for LogEventType {
    fn from(log_type: pb::LogType) -> Self {
        match log_type {
            pb::LogType::Stdout => LogEventType::Stdout,
            pb::LogType::Stderr => LogEventType::Stderr,
            pb::LogType::Error => LogEventType::Error,
            // Unclassified entries are daemon notices
            pb::LogType::Status | pb::LogType::Unspecified => LogEventType::Status,
        }
    }
}

// ============================================================================
// LogEvent conversions
// ============================================================================

impl From<pb::LogEntry> for LogEvent {
    fn from(entry: pb::LogEntry) -> Self {
        let task_status = if entry.task_status.is_empty() {
            None
        } else {
            Some(entry.task_status.clone())
        };
        LogEvent {
            event_type: entry.r#type().into(),
            content: entry.content,
            timestamp_ms: entry.timestamp_ms,
            task_completed: entry.task_completed,
            task_status,
        }
    }
}

impl From<LogEvent> for pb::LogEntry {
    fn from(event: LogEvent) -> Self {
        pb::LogEntry {
            r#type: pb::LogType::from(event.event_type) as i32,
            content: event.content,
            timestamp_ms: event.timestamp_ms,
            task_completed: event.task_completed,
            task_status: event.task_status.unwrap_or_default(),
        }
    }
}

impl From<&LogEvent> for pb::ExecuteResponse {
    fn from(event: &LogEvent) -> Self {
        pb::ExecuteResponse {
            r#type: pb::LogType::from(event.event_type) as i32,
            content: event.content.clone(),
            timestamp_ms: event.timestamp_ms,
            finished: false,
            exit_code: 0,
        }
    }
}

// ============================================================================
// TaskRecord conversions
// ============================================================================

/// Unix milliseconds to a timestamp; zero means "not set".
pub fn millis_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    if ms <= 0 {
        return None;
    }
    Utc.timestamp_millis_opt(ms).single()
}

/// Optional timestamp to unix milliseconds; `None` becomes zero.
pub fn datetime_to_millis(dt: Option<DateTime<Utc>>) -> i64 {
    dt.map(|d| d.timestamp_millis()).unwrap_or(0)
}

/// Build a [`TaskRecord`] from a daemon status response.
pub fn task_record_from_status(
    sandbox_id: SandboxId,
    status: pb::GetTaskStatusResponse,
) -> Result<TaskRecord, CoreError> {
    let state = task_state_from_i32(status.state)?;
    let error = if state == TaskState::Failed && !status.message.is_empty() {
        Some(status.message.clone())
    } else {
        None
    };

    Ok(TaskRecord {
        id: TaskId::new(status.task_id),
        sandbox_id,
        prompt: status.prompt,
        model: status.model,
        work_dir: status.work_dir,
        state,
        message: status.message,
        started_at: millis_to_datetime(status.started_at_ms),
        finished_at: millis_to_datetime(status.finished_at_ms),
        exit_code: status.has_exit_code.then_some(status.exit_code),
        error,
    })
}
