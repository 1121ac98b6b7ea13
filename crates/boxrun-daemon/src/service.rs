//! AgentDaemon gRPC service implementation.

use std::path::PathBuf;
use std::pin::Pin;
use std::time::Instant;

use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::{error, info, warn};

use boxrun_core::{LogEvent, LogEventType, TaskId, TaskState};
use boxrun_proto::convert::datetime_to_millis;
use boxrun_proto::pb::{
    CreateTaskRequest, CreateTaskResponse, ExecuteRequest, ExecuteResponse, GetTaskStatusRequest,
    GetTaskStatusResponse, InitRequest, InitResponse, LogEntry, LogType, StreamLogsRequest,
};
use boxrun_proto::{AgentDaemon, AgentDaemonServer};

use crate::config::DaemonConfig;
use crate::error::DaemonError;
use crate::executor::AgentRunner;
use crate::tasks::{TaskSpec, TaskTable};

type ResponseStream<T> = Pin<Box<dyn tokio_stream::Stream<Item = Result<T, Status>> + Send>>;

/// AgentDaemon implementation.
#[derive(Clone)]
pub struct DaemonService {
    tasks: TaskTable,
    runner: AgentRunner,
    log_dir: Option<PathBuf>,
    default_model: String,
    started: Instant,
}

impl DaemonService {
    /// Create a new DaemonService.
    ///
    /// The log directory is created up front; if that fails, file logging is
    /// disabled and output is only kept in memory.
    pub fn new(config: &DaemonConfig) -> Self {
        let log_dir = config.log_dir.clone().and_then(|dir| {
            match std::fs::create_dir_all(&dir) {
                Ok(()) => Some(dir),
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "Task log files disabled");
                    None
                }
            }
        });

        Self {
            tasks: TaskTable::new(config.broadcast_capacity, config.max_finished_tasks),
            runner: AgentRunner::from_config(config),
            log_dir,
            default_model: config.default_model.clone(),
            started: Instant::now(),
        }
    }

    /// Convert into a tonic server.
    pub fn into_server(self) -> AgentDaemonServer<Self> {
        AgentDaemonServer::new(self)
    }

    fn build_spec(
        &self,
        prompt: String,
        work_dir: String,
        env: std::collections::HashMap<String, String>,
        api_key: String,
        model: String,
    ) -> Result<TaskSpec, DaemonError> {
        if prompt.trim().is_empty() {
            return Err(DaemonError::InvalidRequest("prompt is empty".to_string()));
        }
        let model = if model.is_empty() {
            self.default_model.clone()
        } else {
            model
        };
        Ok(TaskSpec {
            prompt,
            work_dir,
            model,
            env,
            api_key,
        })
    }

    /// Register a task and start it in the background.
    async fn start_task(&self, spec: TaskSpec) -> TaskId {
        let task_id = self.tasks.insert(spec.clone()).await;
        info!(task_id = %task_id, "Task accepted");
        self.spawn_run(task_id.clone(), spec);
        task_id
    }

    fn spawn_run(&self, task_id: TaskId, spec: TaskSpec) {
        let tasks = self.tasks.clone();
        let runner = self.runner.clone();
        let log_path = self
            .log_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.log", task_id)));

        tokio::spawn(async move {
            run_task(tasks, runner, task_id, spec, log_path).await;
        });
    }
}

/// Drive one task from Pending to a terminal state.
async fn run_task(
    tasks: TaskTable,
    runner: AgentRunner,
    task_id: TaskId,
    spec: TaskSpec,
    log_path: Option<PathBuf>,
) {
    if let Err(e) = tasks.mark_running(&task_id).await {
        error!(task_id = %task_id, error = %e, "Failed to mark task running");
        return;
    }

    let mut log_file = match &log_path {
        Some(path) => match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
        {
            Ok(file) => Some(file),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to open task log file");
                None
            }
        },
        None => None,
    };

    let (tx, mut rx) = mpsc::channel::<LogEvent>(64);
    let run = tokio::spawn(async move { runner.run(&spec, tx).await });

    while let Some(event) = rx.recv().await {
        if let Some(file) = log_file.as_mut() {
            if let Err(e) = file.write_all(event.content.as_bytes()).await {
                warn!(task_id = %task_id, error = %e, "Failed to write task log");
                log_file = None;
            }
        }
        if let Err(e) = tasks.record(&task_id, event).await {
            warn!(task_id = %task_id, error = %e, "Failed to record event");
        }
    }

    let (state, exit_code, message) = match run.await {
        Ok(Ok(0)) => (TaskState::Completed, Some(0), "exit code 0".to_string()),
        Ok(Ok(code)) => (
            TaskState::Failed,
            Some(code),
            format!("agent exited with code {code}"),
        ),
        Ok(Err(e)) => {
            let _ = tasks
                .record(&task_id, LogEvent::transport_error(e.to_string()))
                .await;
            (TaskState::Failed, None, e.to_string())
        }
        Err(e) => (TaskState::Failed, None, format!("agent task panicked: {e}")),
    };

    if let Some(file) = log_file.as_mut() {
        let line = format!("\n[{}] {}\n", state, message);
        let _ = file.write_all(line.as_bytes()).await;
    }

    match tasks.finish(&task_id, state, exit_code, message).await {
        Ok(_) => info!(task_id = %task_id, state = %state, "Task finished"),
        Err(e) => error!(task_id = %task_id, error = %e, "Failed to finish task"),
    }
}

/// Pump a subscription into an outbound channel, stopping after the
/// completion event.
async fn forward_subscription<T, F>(
    history: Vec<LogEvent>,
    live: Option<broadcast::Receiver<LogEvent>>,
    tx: mpsc::Sender<Result<T, Status>>,
    map: F,
) where
    F: Fn(LogEvent) -> T,
{
    for event in history {
        let done = event.task_completed;
        if tx.send(Ok(map(event))).await.is_err() || done {
            return;
        }
    }

    let Some(mut live) = live else {
        return;
    };

    loop {
        match live.recv().await {
            Ok(event) => {
                let done = event.task_completed;
                if tx.send(Ok(map(event))).await.is_err() || done {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped = skipped, "Log follower lagged");
                // Not terminal: the stream carries on after the gap
                let notice = LogEvent::new(
                    LogEventType::Status,
                    format!("log follower fell behind, {skipped} entries skipped"),
                );
                if tx.send(Ok(map(notice))).await.is_err() {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

#[tonic::async_trait]
impl AgentDaemon for DaemonService {
    type StreamLogsStream = ResponseStream<LogEntry>;
    type ExecuteStream = ResponseStream<ExecuteResponse>;

    async fn init(&self, _request: Request<InitRequest>) -> Result<Response<InitResponse>, Status> {
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
        let active = self.tasks.active_count().await;
        Ok(Response::new(InitResponse {
            version: env!("CARGO_PKG_VERSION").to_string(),
            hostname,
            uptime_secs: self.started.elapsed().as_secs(),
            active_tasks: u32::try_from(active).unwrap_or(u32::MAX),
        }))
    }

    async fn create_task(
        &self,
        request: Request<CreateTaskRequest>,
    ) -> Result<Response<CreateTaskResponse>, Status> {
        let req = request.into_inner();
        let spec = match self.build_spec(req.prompt, req.work_dir, req.env, req.api_key, req.model)
        {
            Ok(spec) => spec,
            Err(e) => {
                warn!(error = %e, "Rejected task");
                return Ok(Response::new(CreateTaskResponse {
                    success: false,
                    task_id: String::new(),
                    message: e.to_string(),
                }));
            }
        };

        let task_id = self.start_task(spec).await;
        Ok(Response::new(CreateTaskResponse {
            success: true,
            task_id: task_id.into_inner(),
            message: "task started".to_string(),
        }))
    }

    async fn get_task_status(
        &self,
        request: Request<GetTaskStatusRequest>,
    ) -> Result<Response<GetTaskStatusResponse>, Status> {
        let task_id = TaskId::new(request.into_inner().task_id);
        let snap = self
            .tasks
            .get(&task_id)
            .await
            .ok_or_else(|| DaemonError::TaskNotFound(task_id.to_string()))?;

        Ok(Response::new(GetTaskStatusResponse {
            task_id: snap.id.into_inner(),
            state: boxrun_proto::pb::TaskState::from(snap.state) as i32,
            message: snap.message,
            exit_code: snap.exit_code.unwrap_or_default(),
            has_exit_code: snap.exit_code.is_some(),
            created_at_ms: snap.created_at.timestamp_millis(),
            started_at_ms: datetime_to_millis(snap.started_at),
            finished_at_ms: datetime_to_millis(snap.finished_at),
            prompt: snap.spec.prompt,
            work_dir: snap.spec.work_dir,
            model: snap.spec.model,
        }))
    }

    async fn stream_logs(
        &self,
        request: Request<StreamLogsRequest>,
    ) -> Result<Response<Self::StreamLogsStream>, Status> {
        let req = request.into_inner();
        let task_id = TaskId::new(req.task_id);
        let sub = self
            .tasks
            .subscribe(&task_id, req.include_history, req.follow, req.from_timestamp_ms)
            .await?;

        info!(
            task_id = %task_id,
            follow = req.follow,
            history = sub.history.len(),
            "Log stream opened"
        );

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(forward_subscription(
            sub.history,
            sub.live,
            tx,
            |event: LogEvent| LogEntry::from(event),
        ));

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn execute(
        &self,
        request: Request<ExecuteRequest>,
    ) -> Result<Response<Self::ExecuteStream>, Status> {
        let req = request.into_inner();
        let spec = self.build_spec(req.prompt, req.work_dir, req.env, req.api_key, req.model)?;

        // Subscribe before the task can emit anything
        let task_id = self.tasks.insert(spec.clone()).await;
        let sub = self.tasks.subscribe(&task_id, true, true, None).await?;

        self.spawn_run(task_id.clone(), spec);

        info!(task_id = %task_id, "Synchronous execution started");

        let table = self.tasks.clone();
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let (inner_tx, mut inner_rx) = mpsc::channel::<Result<LogEvent, Status>>(64);
            let forward = tokio::spawn(forward_subscription(
                sub.history,
                sub.live,
                inner_tx,
                |event: LogEvent| event,
            ));

            while let Some(Ok(event)) = inner_rx.recv().await {
                if event.task_completed {
                    let exit_code = table
                        .get(&task_id)
                        .await
                        .and_then(|snap| snap.exit_code)
                        .unwrap_or(-1);
                    let done = ExecuteResponse {
                        r#type: LogType::Status as i32,
                        content: event.content,
                        timestamp_ms: event.timestamp_ms,
                        finished: true,
                        exit_code,
                    };
                    let _ = tx.send(Ok(done)).await;
                    break;
                }
                if tx.send(Ok(ExecuteResponse::from(&event))).await.is_err() {
                    break;
                }
            }
            forward.abort();
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}
