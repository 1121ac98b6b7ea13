//! In-memory task table with per-task output history.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use boxrun_core::{LogEvent, TaskId, TaskState};

use crate::error::DaemonError;

/// Parameters a task was created with.
#[derive(Debug, Clone, Default)]
pub struct TaskSpec {
    pub prompt: String,
    pub work_dir: String,
    pub model: String,
    pub env: HashMap<String, String>,
    pub api_key: String,
}

/// A task tracked by the daemon.
pub struct TaskEntry {
    pub spec: TaskSpec,
    pub state: TaskState,
    pub message: String,
    pub exit_code: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Everything the task has emitted so far, in order.
    pub history: Vec<LogEvent>,
    live: broadcast::Sender<LogEvent>,
}

/// Point-in-time copy of a task, without its history.
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub spec: TaskSpec,
    pub state: TaskState,
    pub message: String,
    pub exit_code: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A log subscription: replayed history plus, for unfinished tasks, a live
/// receiver that picks up exactly where the history ends.
pub struct Subscription {
    pub history: Vec<LogEvent>,
    pub live: Option<broadcast::Receiver<LogEvent>>,
}

/// Shared table of tasks, keyed by id.
///
/// At most `max_finished` terminal tasks are retained; the oldest finished
/// task is evicted each time that bound is exceeded.
#[derive(Clone)]
pub struct TaskTable {
    inner: Arc<RwLock<HashMap<TaskId, TaskEntry>>>,
    broadcast_capacity: usize,
    max_finished: usize,
}

impl TaskTable {
    pub fn new(broadcast_capacity: usize, max_finished: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            broadcast_capacity: broadcast_capacity.max(1),
            max_finished: max_finished.max(1),
        }
    }

    /// Register a new pending task and return its id.
    pub async fn insert(&self, spec: TaskSpec) -> TaskId {
        let id = TaskId::generate();
        let (live, _) = broadcast::channel(self.broadcast_capacity);
        let entry = TaskEntry {
            spec,
            state: TaskState::Pending,
            message: "queued".to_string(),
            exit_code: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            history: Vec::new(),
            live,
        };
        self.inner.write().await.insert(id.clone(), entry);
        id
    }

    /// Mark a task as running.
    pub async fn mark_running(&self, id: &TaskId) -> Result<(), DaemonError> {
        let mut tasks = self.inner.write().await;
        let entry = tasks
            .get_mut(id)
            .ok_or_else(|| DaemonError::TaskNotFound(id.to_string()))?;
        entry.state = entry.state.advance(TaskState::Running).map_err(|e| {
            DaemonError::InvalidRequest(e.to_string())
        })?;
        entry.message = "running".to_string();
        entry.started_at = Some(Utc::now());
        Ok(())
    }

    /// Append an event to a task's history and publish it to followers.
    pub async fn record(&self, id: &TaskId, event: LogEvent) -> Result<(), DaemonError> {
        let mut tasks = self.inner.write().await;
        let entry = tasks
            .get_mut(id)
            .ok_or_else(|| DaemonError::TaskNotFound(id.to_string()))?;
        entry.history.push(event.clone());
        // No receivers is fine
        let _ = entry.live.send(event);
        Ok(())
    }

    /// Move a task to a terminal state and publish its completion event.
    pub async fn finish(
        &self,
        id: &TaskId,
        state: TaskState,
        exit_code: Option<i32>,
        message: impl Into<String>,
    ) -> Result<LogEvent, DaemonError> {
        let message = message.into();
        let mut tasks = self.inner.write().await;
        let entry = tasks
            .get_mut(id)
            .ok_or_else(|| DaemonError::TaskNotFound(id.to_string()))?;

        entry.state = entry
            .state
            .advance(state)
            .map_err(|e| DaemonError::InvalidRequest(e.to_string()))?;
        entry.exit_code = exit_code;
        entry.message = message.clone();
        entry.finished_at = Some(Utc::now());

        let event = LogEvent::completed(state, message);
        entry.history.push(event.clone());
        let _ = entry.live.send(event.clone());

        evict_finished(&mut tasks, self.max_finished);
        Ok(event)
    }

    /// Get a snapshot of a task.
    pub async fn get(&self, id: &TaskId) -> Option<TaskSnapshot> {
        let tasks = self.inner.read().await;
        tasks.get(id).map(|entry| TaskSnapshot {
            id: id.clone(),
            spec: entry.spec.clone(),
            state: entry.state,
            message: entry.message.clone(),
            exit_code: entry.exit_code,
            created_at: entry.created_at,
            started_at: entry.started_at,
            finished_at: entry.finished_at,
        })
    }

    /// Subscribe to a task's output.
    ///
    /// History and the live receiver are taken under one lock, so no event
    /// is missed or duplicated between them.
    pub async fn subscribe(
        &self,
        id: &TaskId,
        include_history: bool,
        follow: bool,
        from_timestamp_ms: Option<i64>,
    ) -> Result<Subscription, DaemonError> {
        let tasks = self.inner.read().await;
        let entry = tasks
            .get(id)
            .ok_or_else(|| DaemonError::TaskNotFound(id.to_string()))?;

        let history = if include_history {
            entry
                .history
                .iter()
                .filter(|e| from_timestamp_ms.map_or(true, |from| e.timestamp_ms >= from))
                .cloned()
                .collect()
        } else {
            Vec::new()
        };

        let live = if follow && !entry.state.is_terminal() {
            Some(entry.live.subscribe())
        } else {
            None
        };

        Ok(Subscription { history, live })
    }

    /// Number of tasks that have not finished.
    pub async fn active_count(&self) -> usize {
        self.inner
            .read()
            .await
            .values()
            .filter(|e| !e.state.is_terminal())
            .count()
    }
}

/// Drop the oldest finished tasks until at most `keep` remain.
fn evict_finished(tasks: &mut HashMap<TaskId, TaskEntry>, keep: usize) {
    let mut finished: Vec<(DateTime<Utc>, TaskId)> = tasks
        .iter()
        .filter_map(|(id, entry)| entry.finished_at.map(|at| (at, id.clone())))
        .collect();
    if finished.len() <= keep {
        return;
    }
    finished.sort();
    let excess = finished.len() - keep;
    for (_, id) in finished.into_iter().take(excess) {
        tasks.remove(&id);
        debug!(task_id = %id, "Evicted finished task");
    }
}
