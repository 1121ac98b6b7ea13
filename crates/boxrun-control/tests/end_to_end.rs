//! End-to-end flow against an in-process daemon.
//!
//! The container runtime is faked: every "container" resolves to
//! 127.0.0.1, where a real `boxrun-daemon` service runs `sh -c {prompt}`.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;

use boxrun_control::cloud::{CloudApi, CloudError, CreateRemoteSandbox, RemoteSandbox};
use boxrun_control::credentials::CredentialResolver;
use boxrun_control::orchestrator::TaskRequest;
use boxrun_control::runtime::{
    CommandOutput, ContainerRuntime, ContainerSpec, ContainerSummary, RuntimeError,
};
use boxrun_control::{ControlConfig, ControlPlane, ErrorKind, RelayOutcome, StreamRequest};
use boxrun_core::{ListFilter, Locality, LogEvent, LogEventType, SandboxSpec, TaskState};
use boxrun_daemon::config::DaemonConfig;
use boxrun_daemon::service::DaemonService;

/// Runtime whose containers all live at 127.0.0.1.
#[derive(Default)]
struct LoopbackRuntime {
    containers: Mutex<Vec<ContainerSummary>>,
    commands: Mutex<Vec<Vec<String>>>,
}

#[async_trait]
impl ContainerRuntime for LoopbackRuntime {
    async fn find_by_name(&self, name: &str) -> Result<Vec<ContainerSummary>, RuntimeError> {
        Ok(self
            .containers
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.name == name)
            .cloned()
            .collect())
    }

    async fn inspect_address(&self, _container_id: &str) -> Result<String, RuntimeError> {
        Ok("127.0.0.1".to_string())
    }

    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let mut containers = self.containers.lock().unwrap();
        let id = format!("{:x>64}", containers.len());
        containers.push(ContainerSummary {
            id: id.clone(),
            name: spec.name.clone(),
            state: "running".to_string(),
            created_at: chrono::Utc::now(),
        });
        Ok(id)
    }

    async fn start(&self, _container_id: &str) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn remove(&self, container_id: &str, _force: bool) -> Result<(), RuntimeError> {
        self.containers
            .lock()
            .unwrap()
            .retain(|c| c.id != container_id);
        Ok(())
    }

    async fn exec(
        &self,
        _container_id: &str,
        command: Vec<String>,
    ) -> Result<CommandOutput, RuntimeError> {
        self.commands.lock().unwrap().push(command);
        Ok(CommandOutput {
            stdout: "daemon log line\n".to_string(),
            ..Default::default()
        })
    }
}

/// Cloud provider holding sandboxes in memory.
#[derive(Default)]
struct MemoryCloud {
    sandboxes: Mutex<Vec<RemoteSandbox>>,
}

#[async_trait]
impl CloudApi for MemoryCloud {
    async fn create(&self, request: &CreateRemoteSandbox) -> Result<RemoteSandbox, CloudError> {
        let sandbox = RemoteSandbox {
            id: format!("remote-{}", request.name),
            name: request.name.clone(),
            state: "started".to_string(),
            region: Some("eu".to_string()),
            created_at: chrono::Utc::now(),
            labels: request.labels.clone(),
        };
        self.sandboxes.lock().unwrap().push(sandbox.clone());
        Ok(sandbox)
    }

    async fn list(&self) -> Result<Vec<RemoteSandbox>, CloudError> {
        Ok(self.sandboxes.lock().unwrap().clone())
    }

    async fn get(&self, id: &str) -> Result<RemoteSandbox, CloudError> {
        self.sandboxes
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or_else(|| CloudError::NotFound(id.to_string()))
    }

    async fn start(&self, _id: &str) -> Result<(), CloudError> {
        Ok(())
    }

    async fn delete(&self, id: &str, _force: bool) -> Result<(), CloudError> {
        self.sandboxes.lock().unwrap().retain(|s| s.id != id);
        Ok(())
    }

    async fn exec(&self, _id: &str, _command: &[String]) -> Result<CommandOutput, CloudError> {
        Ok(CommandOutput::default())
    }

    async fn upload_file(&self, _id: &str, _path: &str, _content: Vec<u8>) -> Result<(), CloudError> {
        Ok(())
    }

    async fn work_dir(&self, _id: &str) -> Result<String, CloudError> {
        Ok("/home/agent".to_string())
    }
}

/// Start a daemon on an ephemeral port and return the port.
async fn spawn_daemon() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let service = DaemonService::new(&DaemonConfig::shell());

    tokio::spawn(async move {
        Server::builder()
            .add_service(service.into_server())
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });
    port
}

fn credentials(dir: &Path) -> CredentialResolver {
    let path = dir.join("credentials");
    std::fs::write(&path, "api_key = sk-test\n").unwrap();
    CredentialResolver::new(None, Some(path), None)
}

fn config(dir: &Path, port: u16) -> ControlConfig {
    let mut config = ControlConfig::default()
        .with_home_dir(dir.to_path_buf())
        .with_daemon_port(port);
    config.store_open_attempts = 2;
    config.store_retry_backoff = Duration::from_millis(10);
    config.connect_timeout = Duration::from_secs(2);
    config.run_timeout = Duration::from_secs(30);
    config
}

fn control(
    dir: &Path,
    port: u16,
    runtime: Arc<LoopbackRuntime>,
    cloud: Option<Arc<MemoryCloud>>,
) -> ControlPlane {
    ControlPlane::new(
        config(dir, port),
        runtime,
        cloud.map(|c| c as Arc<dyn CloudApi>),
        credentials(dir),
    )
}

#[tokio::test]
async fn test_demo_sandbox_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let port = spawn_daemon().await;
    let runtime = Arc::new(LoopbackRuntime::default());
    let control = control(dir.path(), port, runtime.clone(), None);

    // Create and list
    let record = control
        .create_sandbox(&SandboxSpec::named("demo"))
        .await
        .unwrap();
    assert_eq!(record.locality, Locality::Local);

    let local = control
        .list_sandboxes(&ListFilter::local_only())
        .await
        .unwrap();
    assert_eq!(local.len(), 1);
    assert_eq!(local[0].name, "demo");

    // Async task
    let task_id = control
        .create_task("demo", TaskRequest::new("echo hi"))
        .await
        .unwrap();
    assert!(!task_id.is_empty());

    let finished = control
        .wait_task("demo", &task_id, Duration::from_millis(50))
        .await
        .unwrap();
    assert_eq!(finished.state, TaskState::Completed);
    assert_eq!(finished.exit_code, Some(0));

    let status = control.get_task_status("demo", &task_id).await.unwrap();
    assert_eq!(status.state, TaskState::Completed);
    assert_eq!(status.sandbox_id, record.id);

    // Replay logs
    let (mut tx, mut rx) = mpsc::channel::<LogEvent>(64);
    let request = StreamRequest::new(task_id.clone()).with_follow(false);
    let outcome = control
        .stream_task_logs("demo", &request, &mut tx)
        .await
        .unwrap();
    drop(tx);
    assert!(matches!(outcome, RelayOutcome::Completed { .. }));

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    let hi = events
        .iter()
        .position(|e| e.event_type == LogEventType::Stdout && e.content.contains("hi"))
        .expect("stdout event with 'hi'");
    let last = events.last().unwrap();
    assert!(hi < events.len() - 1);
    assert!(last.task_completed);
    assert_eq!(last.task_status.as_deref(), Some("COMPLETED"));

    // Delete
    control.delete_sandbox("demo", false).await.unwrap();
    assert!(control
        .list_sandboxes(&ListFilter::local_only())
        .await
        .unwrap()
        .is_empty());
    assert!(runtime.containers.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_legacy_run_and_daemon_status() {
    let dir = tempfile::tempdir().unwrap();
    let port = spawn_daemon().await;
    let runtime = Arc::new(LoopbackRuntime::default());
    let control = control(dir.path(), port, runtime.clone(), None);
    control
        .create_sandbox(&SandboxSpec::default().with_branch("feature/legacy"))
        .await
        .unwrap();

    let output = control
        .run_task("feature-legacy", TaskRequest::new("echo out; echo err 1>&2"))
        .await
        .unwrap();
    assert!(output.success);
    assert_eq!(output.output, "out\n");
    assert_eq!(output.error, "err\n");
    assert_eq!(output.exit_code, Some(0));

    let failed = control
        .run_task("feature-legacy", TaskRequest::new("exit 4"))
        .await
        .unwrap();
    assert!(!failed.success);
    assert_eq!(failed.exit_code, Some(4));

    let status = control.daemon_status("feature-legacy").await.unwrap();
    assert_eq!(status.endpoint.port, port);
    assert!(!status.info.version.is_empty());
    assert_eq!(status.info.active_tasks, 0);

    let logs = control
        .daemon_logs("feature-legacy", None, 20)
        .await
        .unwrap();
    assert_eq!(logs.stdout, "daemon log line\n");
    let commands = runtime.commands.lock().unwrap();
    assert!(commands[0][2].ends_with("tail -n 20 /var/log/boxrun/*.log"));
}

#[tokio::test]
async fn test_failed_task_observed_as_failed() {
    let dir = tempfile::tempdir().unwrap();
    let port = spawn_daemon().await;
    let control = control(dir.path(), port, Arc::new(LoopbackRuntime::default()), None);
    control
        .create_sandbox(&SandboxSpec::named("demo"))
        .await
        .unwrap();

    let task_id = control
        .create_task("demo", TaskRequest::new("echo bad 1>&2; exit 3"))
        .await
        .unwrap();
    let record = control
        .wait_task("demo", &task_id, Duration::from_millis(50))
        .await
        .unwrap();
    assert_eq!(record.state, TaskState::Failed);
    assert_eq!(record.exit_code, Some(3));
    assert!(record.error.is_some());

    let err = control
        .create_task("demo", TaskRequest::new("   "))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationFailed);
}

#[tokio::test]
async fn test_unknown_sandbox_and_unreachable_daemon() {
    let dir = tempfile::tempdir().unwrap();

    // Reserve a port with nothing behind it
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let control = control(dir.path(), port, Arc::new(LoopbackRuntime::default()), None);

    let err = control
        .create_task("nope", TaskRequest::new("echo hi"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SandboxNotFound);

    control
        .create_sandbox(&SandboxSpec::named("demo"))
        .await
        .unwrap();
    let err = control
        .create_task("demo", TaskRequest::new("echo hi"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DaemonUnavailable);
}

#[tokio::test]
async fn test_missing_api_key() {
    let dir = tempfile::tempdir().unwrap();
    let port = spawn_daemon().await;
    let control = ControlPlane::new(
        config(dir.path(), port),
        Arc::new(LoopbackRuntime::default()),
        None,
        CredentialResolver::new(None, None, None),
    );
    control
        .create_sandbox(&SandboxSpec::named("demo"))
        .await
        .unwrap();

    let err = control
        .create_task("demo", TaskRequest::new("echo hi"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ApiKeyMissing);
}

#[tokio::test]
async fn test_remote_sandbox_daemon_is_unsupported() {
    let dir = tempfile::tempdir().unwrap();
    let cloud = Arc::new(MemoryCloud::default());
    let control = control(
        dir.path(),
        7420,
        Arc::new(LoopbackRuntime::default()),
        Some(cloud.clone()),
    );

    let record = control
        .create_sandbox(
            &SandboxSpec::named("cloudy")
                .with_locality(Locality::Remote)
                .with_group("team"),
        )
        .await
        .unwrap();
    assert_eq!(record.locality, Locality::Remote);
    assert_eq!(record.group.as_deref(), Some("team"));

    let found = control.find_sandbox("cloudy").await.unwrap();
    assert_eq!(found.id, record.id);

    let started = tokio::time::Instant::now();
    let err = control
        .create_task("cloudy", TaskRequest::new("echo hi"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SystemUnavailable);
    assert!(started.elapsed() < Duration::from_secs(1));

    let err = control.daemon_status("cloudy").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SystemUnavailable);

    control.delete_sandbox("cloudy", true).await.unwrap();
    assert!(cloud.sandboxes.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_store_lock_shared_between_control_planes() {
    let dir = tempfile::tempdir().unwrap();
    let first = control(dir.path(), 7420, Arc::new(LoopbackRuntime::default()), None);
    let second = control(dir.path(), 7420, Arc::new(LoopbackRuntime::default()), None);

    first
        .create_sandbox(&SandboxSpec::named("demo"))
        .await
        .unwrap();

    // `first` keeps the store open until closed
    let err = second
        .list_sandboxes(&ListFilter::local_only())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StoreLocked);

    first.close().await;
    let listed = second
        .list_sandboxes(&ListFilter::local_only())
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
}
