//! Task orchestration.
//!
//! Tasks are created asynchronously and observed by polling or by relaying
//! their log stream. [`TaskOrchestrator::run_task`] is the older blocking
//! path kept for callers that still want one aggregated result.

use std::collections::HashMap;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tracing::{debug, info, warn};

use boxrun_core::{LogEventType, RunOutput, SandboxRecord, TaskId, TaskRecord, TaskState};
use boxrun_proto::convert::task_record_from_status;
use boxrun_proto::pb::{
    CreateTaskRequest, ExecuteRequest, ExecuteResponse, GetTaskStatusRequest,
};

use crate::backend::SandboxBackend;
use crate::connector::{deadline_exceeded, DaemonConnection, DaemonConnector};
use crate::credentials::CredentialResolver;
use crate::error::ControlError;
use crate::Result;

/// A prompt to run in a sandbox.
#[derive(Debug, Clone, Default)]
pub struct TaskRequest {
    pub prompt: String,
    /// Model override; the configured default is used when absent.
    pub model: Option<String>,
    pub env: HashMap<String, String>,
}

impl TaskRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    fn validate(&self) -> Result<()> {
        if self.prompt.trim().is_empty() {
            return Err(ControlError::ValidationFailed("prompt is required".to_string()));
        }
        Ok(())
    }
}

/// Everything the daemon needs to start a task.
#[derive(Debug, Clone)]
struct PreparedTask {
    prompt: String,
    work_dir: String,
    env: HashMap<String, String>,
    api_key: String,
    model: String,
}

impl PreparedTask {
    fn into_create(self) -> CreateTaskRequest {
        CreateTaskRequest {
            prompt: self.prompt,
            work_dir: self.work_dir,
            env: self.env,
            api_key: self.api_key,
            model: self.model,
        }
    }

    fn into_execute(self) -> ExecuteRequest {
        ExecuteRequest {
            prompt: self.prompt,
            work_dir: self.work_dir,
            env: self.env,
            api_key: self.api_key,
            model: self.model,
        }
    }
}

/// RPC deadlines used by the orchestrator.
#[derive(Debug, Clone, Copy)]
pub struct TaskTimeouts {
    pub status: Duration,
    pub create: Duration,
    pub run: Duration,
}

/// Checks that successive observations of a task never move backwards.
#[derive(Debug, Clone, Default)]
pub struct StateObserver {
    last: Option<TaskState>,
}

impl StateObserver {
    /// Record an observation, rejecting regressions as [`ControlError::TaskInvalid`].
    pub fn observe(&mut self, state: TaskState) -> Result<TaskState> {
        let state = match self.last {
            Some(prev) => prev.advance(state)?,
            None => state,
        };
        self.last = Some(state);
        Ok(state)
    }

    pub fn last(&self) -> Option<TaskState> {
        self.last
    }
}

pub struct TaskOrchestrator {
    connector: DaemonConnector,
    credentials: CredentialResolver,
    default_model: String,
    timeouts: TaskTimeouts,
}

impl TaskOrchestrator {
    pub fn new(
        connector: DaemonConnector,
        credentials: CredentialResolver,
        default_model: impl Into<String>,
        timeouts: TaskTimeouts,
    ) -> Self {
        Self {
            connector,
            credentials,
            default_model: default_model.into(),
            timeouts,
        }
    }

    pub fn connector(&self) -> &DaemonConnector {
        &self.connector
    }

    async fn prepare(
        &self,
        backend: &dyn SandboxBackend,
        sandbox: &SandboxRecord,
        request: TaskRequest,
    ) -> Result<PreparedTask> {
        request.validate()?;
        let api_key = self.credentials.api_key()?;
        let work_dir = backend.work_dir(sandbox).await?;
        Ok(PreparedTask {
            prompt: request.prompt,
            work_dir,
            env: request.env,
            api_key,
            model: request
                .model
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| self.default_model.clone()),
        })
    }

    async fn connect(
        &self,
        backend: &dyn SandboxBackend,
        sandbox: &SandboxRecord,
    ) -> Result<DaemonConnection> {
        self.connector.connect(backend, sandbox).await
    }

    /// Start a task and return its id without waiting for it.
    pub async fn create_task(
        &self,
        backend: &dyn SandboxBackend,
        sandbox: &SandboxRecord,
        request: TaskRequest,
    ) -> Result<TaskId> {
        let prepared = self.prepare(backend, sandbox, request).await?;
        let mut conn = self.connect(backend, sandbox).await?;

        let timeout = self.timeouts.create;
        let call = conn.client().create_task(prepared.into_create());
        let response = tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| ControlError::rpc("create_task", deadline_exceeded(timeout)))?
            .map_err(|status| ControlError::rpc("create_task", status))?
            .into_inner();

        if !response.success {
            return Err(ControlError::TaskInvalid(response.message));
        }
        if response.task_id.is_empty() {
            return Err(ControlError::TaskInvalid(
                "daemon accepted the task without an id".to_string(),
            ));
        }

        info!(sandbox = %sandbox.name, task_id = %response.task_id, "Task created");
        Ok(TaskId::new(response.task_id))
    }

    /// Current status of a task. Failures are returned as-is.
    pub async fn get_task_status(
        &self,
        backend: &dyn SandboxBackend,
        sandbox: &SandboxRecord,
        task_id: &TaskId,
    ) -> Result<TaskRecord> {
        let mut conn = self.connect(backend, sandbox).await?;

        let timeout = self.timeouts.status;
        let call = conn.client().get_task_status(GetTaskStatusRequest {
            task_id: task_id.to_string(),
        });
        let response = tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| ControlError::rpc("get_task_status", deadline_exceeded(timeout)))?
            .map_err(|status| ControlError::rpc("get_task_status", status))?
            .into_inner();

        Ok(task_record_from_status(sandbox.id.clone(), response)?)
    }

    /// Poll until the task reaches a terminal state.
    ///
    /// Gives up after the run timeout. A state observed going backwards is
    /// reported as [`ControlError::TaskInvalid`].
    pub async fn wait_for_completion(
        &self,
        backend: &dyn SandboxBackend,
        sandbox: &SandboxRecord,
        task_id: &TaskId,
        poll_interval: Duration,
    ) -> Result<TaskRecord> {
        let deadline = tokio::time::Instant::now() + self.timeouts.run;
        let mut observer = StateObserver::default();

        loop {
            let record = self.get_task_status(backend, sandbox, task_id).await?;
            let state = observer.observe(record.state)?;
            if state.is_terminal() {
                return Ok(record);
            }
            debug!(task_id = %task_id, %state, "Task not finished yet");

            if tokio::time::Instant::now() + poll_interval > deadline {
                return Err(ControlError::rpc(
                    "wait_for_completion",
                    deadline_exceeded(self.timeouts.run),
                ));
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Run a prompt and block until the daemon reports it finished.
    pub async fn run_task(
        &self,
        backend: &dyn SandboxBackend,
        sandbox: &SandboxRecord,
        request: TaskRequest,
    ) -> Result<RunOutput> {
        let prepared = self.prepare(backend, sandbox, request).await?;
        let mut conn = self.connect(backend, sandbox).await?;
        info!(sandbox = %sandbox.name, "Running task synchronously");

        let timeout = self.timeouts.run;
        let run = async {
            let stream = conn
                .client()
                .execute(prepared.into_execute())
                .await
                .map_err(|status| ControlError::rpc("execute", status))?
                .into_inner();
            Ok::<_, ControlError>(collect_run_output(stream).await)
        };

        let output = tokio::time::timeout(timeout, run)
            .await
            .map_err(|_| ControlError::rpc("execute", deadline_exceeded(timeout)))??;

        info!(
            sandbox = %sandbox.name,
            success = output.success,
            exit_code = ?output.exit_code,
            "Synchronous task finished"
        );
        Ok(output)
    }
}

/// Fold an `Execute` response stream into one result.
///
/// STDOUT goes to `output`, STDERR and ERROR to `error`. A transport error
/// ends the loop and marks the run unsuccessful.
pub async fn collect_run_output<S>(mut stream: S) -> RunOutput
where
    S: Stream<Item = std::result::Result<ExecuteResponse, tonic::Status>> + Unpin,
{
    let mut output = RunOutput::default();
    let mut finished = false;
    let mut broken = false;

    while let Some(item) = stream.next().await {
        match item {
            Ok(resp) => {
                let event_type = LogEventType::from(resp.r#type());
                if event_type == LogEventType::Stdout {
                    output.output.push_str(&resp.content);
                } else if event_type.is_error_output() {
                    output.error.push_str(&resp.content);
                }
                if resp.finished {
                    finished = true;
                    output.exit_code = Some(resp.exit_code);
                    break;
                }
            }
            Err(status) => {
                warn!(code = ?status.code(), message = %status.message(), "Execute stream failed");
                output.error.push_str(status.message());
                broken = true;
                break;
            }
        }
    }

    output.success = finished && !broken && output.exit_code == Some(0);
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use boxrun_proto::pb;

    fn resp(log_type: pb::LogType, content: &str) -> ExecuteResponse {
        ExecuteResponse {
            r#type: log_type as i32,
            content: content.to_string(),
            timestamp_ms: 1,
            finished: false,
            exit_code: 0,
        }
    }

    fn finished(code: i32) -> ExecuteResponse {
        ExecuteResponse {
            finished: true,
            exit_code: code,
            ..resp(pb::LogType::Status, "done")
        }
    }

    #[tokio::test]
    async fn test_collect_concatenates_by_class() {
        let stream = futures::stream::iter(vec![
            Ok(resp(pb::LogType::Stdout, "hel")),
            Ok(resp(pb::LogType::Stderr, "warn ")),
            Ok(resp(pb::LogType::Stdout, "lo")),
            Ok(resp(pb::LogType::Error, "oops")),
            Ok(finished(0)),
            Ok(resp(pb::LogType::Stdout, "after finish")),
        ]);
        let output = collect_run_output(stream).await;
        assert!(output.success);
        assert_eq!(output.output, "hello");
        assert_eq!(output.error, "warn oops");
        assert_eq!(output.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_collect_nonzero_exit_is_unsuccessful() {
        let stream = futures::stream::iter(vec![Ok(finished(2))]);
        let output = collect_run_output(stream).await;
        assert!(!output.success);
        assert_eq!(output.exit_code, Some(2));
    }

    #[tokio::test]
    async fn test_collect_transport_error_stops_and_fails() {
        let stream = futures::stream::iter(vec![
            Ok(resp(pb::LogType::Stdout, "partial")),
            Err(tonic::Status::unavailable("connection reset")),
            Ok(finished(0)),
        ]);
        let output = collect_run_output(stream).await;
        assert!(!output.success);
        assert_eq!(output.output, "partial");
        assert_eq!(output.error, "connection reset");
        assert_eq!(output.exit_code, None);
    }

    #[tokio::test]
    async fn test_collect_stream_without_finish_is_unsuccessful() {
        let stream = futures::stream::iter(vec![Ok(resp(pb::LogType::Stdout, "x"))]);
        assert!(!collect_run_output(stream).await.success);
    }

    #[test]
    fn test_observer_rejects_regression() {
        let mut observer = StateObserver::default();
        observer.observe(TaskState::Pending).unwrap();
        observer.observe(TaskState::Running).unwrap();
        observer.observe(TaskState::Running).unwrap();
        observer.observe(TaskState::Completed).unwrap();

        let err = observer.observe(TaskState::Running).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TaskInvalid);
        assert_eq!(observer.last(), Some(TaskState::Completed));
    }

    #[test]
    fn test_blank_prompt_rejected() {
        let err = TaskRequest::new("  ").validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);
        assert!(TaskRequest::new("echo hi").validate().is_ok());
    }
}
