//! Control plane facade.
//!
//! Resolves sandboxes through the registry, then hands the resolved
//! record and its backend to the orchestrator or relay. The local store is
//! released before any long-lived daemon operation so other control plane
//! processes are not blocked on it.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use boxrun_core::{ListFilter, RunOutput, SandboxRecord, SandboxSpec, TaskId, TaskRecord};

use crate::backend::{LocalBackend, LocalSettings, RemoteBackend, SandboxBackend};
use crate::cloud::{CloudApi, HttpCloudClient};
use crate::config::ControlConfig;
use crate::connector::{DaemonConnector, DaemonEndpoint, DaemonInfo};
use crate::credentials::CredentialResolver;
use crate::error::ControlError;
use crate::orchestrator::{TaskOrchestrator, TaskRequest, TaskTimeouts};
use crate::registry::SandboxRegistry;
use crate::relay::{LogRelay, LogSink, RelayError, RelayOutcome, StreamRequest};
use crate::runtime::{CommandOutput, ContainerRuntime, DockerRuntime};
use crate::store::StoreHandle;
use crate::Result;

/// Daemon liveness as seen from the control plane.
#[derive(Debug, Clone, Serialize)]
pub struct DaemonStatus {
    pub sandbox: String,
    pub endpoint: DaemonEndpoint,
    pub info: DaemonInfo,
}

pub struct ControlPlane {
    config: ControlConfig,
    store: Arc<StoreHandle>,
    registry: SandboxRegistry,
    connector: DaemonConnector,
    orchestrator: TaskOrchestrator,
    relay: LogRelay,
}

impl ControlPlane {
    /// Build a control plane over explicit collaborators.
    pub fn new(
        config: ControlConfig,
        runtime: Arc<dyn ContainerRuntime>,
        cloud: Option<Arc<dyn CloudApi>>,
        credentials: CredentialResolver,
    ) -> Self {
        let store = Arc::new(StoreHandle::new(
            config.store_path.clone(),
            config.store_open_attempts,
            config.store_retry_backoff,
        ));

        let local: Arc<dyn SandboxBackend> = Arc::new(LocalBackend::new(
            runtime,
            store.clone(),
            LocalSettings {
                image: config.default_image.clone(),
                container_prefix: config.container_prefix.clone(),
                work_dir: config.local_work_dir.clone(),
            },
        ));
        let remote = cloud.map(|c| Arc::new(RemoteBackend::new(c)) as Arc<dyn SandboxBackend>);

        let connector = DaemonConnector::new(config.daemon_port, config.connect_timeout);
        let orchestrator = TaskOrchestrator::new(
            connector.clone(),
            credentials,
            config.default_model.clone(),
            TaskTimeouts {
                status: config.status_timeout,
                create: config.create_timeout,
                run: config.run_timeout,
            },
        );
        let relay = LogRelay::new(connector.clone(), config.status_timeout);

        Self {
            registry: SandboxRegistry::new(local, remote),
            store,
            connector,
            orchestrator,
            relay,
            config,
        }
    }

    /// Docker for local sandboxes, plus the cloud provider when an API key is set.
    pub fn from_config(config: ControlConfig) -> Result<Self> {
        let runtime = DockerRuntime::connect()
            .map_err(|e| ControlError::runtime("connecting to container runtime", e))?;
        let cloud = config.cloud_api_key.as_ref().map(|key| {
            Arc::new(HttpCloudClient::new(&config.cloud_url, key.clone())) as Arc<dyn CloudApi>
        });
        Ok(Self::new(
            config,
            Arc::new(runtime),
            cloud,
            CredentialResolver::default(),
        ))
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    pub fn registry(&self) -> &SandboxRegistry {
        &self.registry
    }

    /// Release the local store lock.
    pub async fn close(&self) {
        self.store.close().await;
    }

    // ------------------------------------------------------------------
    // Sandboxes
    // ------------------------------------------------------------------

    pub async fn create_sandbox(&self, spec: &SandboxSpec) -> Result<SandboxRecord> {
        self.registry.create(spec).await
    }

    pub async fn list_sandboxes(&self, filter: &ListFilter) -> Result<Vec<SandboxRecord>> {
        self.registry.list(filter).await
    }

    pub async fn get_sandbox(&self, id: &str) -> Result<SandboxRecord> {
        self.registry.get(id).await
    }

    pub async fn find_sandbox(&self, key: &str) -> Result<SandboxRecord> {
        self.registry.find_by_name(key).await
    }

    pub async fn delete_sandbox(&self, key: &str, force: bool) -> Result<SandboxRecord> {
        self.registry.delete(key, force).await
    }

    pub async fn start_sandbox(&self, key: &str) -> Result<SandboxRecord> {
        self.registry.start(key).await
    }

    /// Resolve a sandbox for a daemon operation and release the store.
    async fn resolve(&self, key: &str) -> Result<(SandboxRecord, &dyn SandboxBackend)> {
        let record = self.registry.find_by_name(key).await?;
        let backend = self.registry.backend_for(&record)?;
        self.store.close().await;
        Ok((record, backend))
    }

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    pub async fn create_task(&self, sandbox: &str, request: TaskRequest) -> Result<TaskId> {
        let (record, backend) = self.resolve(sandbox).await?;
        self.orchestrator.create_task(backend, &record, request).await
    }

    pub async fn run_task(&self, sandbox: &str, request: TaskRequest) -> Result<RunOutput> {
        let (record, backend) = self.resolve(sandbox).await?;
        self.orchestrator.run_task(backend, &record, request).await
    }

    pub async fn get_task_status(&self, sandbox: &str, task_id: &TaskId) -> Result<TaskRecord> {
        let (record, backend) = self.resolve(sandbox).await?;
        self.orchestrator
            .get_task_status(backend, &record, task_id)
            .await
    }

    pub async fn wait_task(
        &self,
        sandbox: &str,
        task_id: &TaskId,
        poll_interval: Duration,
    ) -> Result<TaskRecord> {
        let (record, backend) = self.resolve(sandbox).await?;
        self.orchestrator
            .wait_for_completion(backend, &record, task_id, poll_interval)
            .await
    }

    pub async fn stream_task_logs<K>(
        &self,
        sandbox: &str,
        request: &StreamRequest,
        sink: &mut K,
    ) -> std::result::Result<RelayOutcome, RelayError>
    where
        K: LogSink + ?Sized,
    {
        let (record, backend) = self.resolve(sandbox).await?;
        self.relay.relay(backend, &record, request, sink).await
    }

    // ------------------------------------------------------------------
    // Daemon
    // ------------------------------------------------------------------

    pub async fn daemon_status(&self, sandbox: &str) -> Result<DaemonStatus> {
        let (record, backend) = self.resolve(sandbox).await?;
        let mut conn = self.connector.connect(backend, &record).await?;
        let info = self
            .connector
            .info(&mut conn, self.config.status_timeout)
            .await?;
        Ok(DaemonStatus {
            sandbox: record.name,
            endpoint: conn.endpoint().clone(),
            info,
        })
    }

    /// Tail the daemon's log files inside the sandbox.
    ///
    /// With a task id only that task's log is read.
    pub async fn daemon_logs(
        &self,
        sandbox: &str,
        task_id: Option<&TaskId>,
        lines: usize,
    ) -> Result<CommandOutput> {
        if lines == 0 {
            return Err(ControlError::ValidationFailed(
                "line count must be positive".to_string(),
            ));
        }
        let command = daemon_log_command(&self.config.daemon_log_dir, task_id, lines)?;

        let (record, backend) = self.resolve(sandbox).await?;
        info!(sandbox = %record.name, ?task_id, lines, "Reading daemon logs");
        let output = backend.execute_command(&record, command).await?;
        if !output.success() {
            return Err(ControlError::ProviderUnavailable {
                step: "reading daemon logs",
                reason: format!("exit code {}: {}", output.exit_code, output.stderr.trim()),
            });
        }
        Ok(output)
    }
}

fn daemon_log_command(
    log_dir: &str,
    task_id: Option<&TaskId>,
    lines: usize,
) -> Result<Vec<String>> {
    let dir = log_dir.trim_end_matches('/');
    match task_id {
        Some(id) => {
            let valid = !id.is_empty()
                && id
                    .as_str()
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
            if !valid {
                return Err(ControlError::ValidationFailed(format!(
                    "invalid task id '{id}'"
                )));
            }
            Ok(vec![
                "tail".to_string(),
                "-n".to_string(),
                lines.to_string(),
                format!("{dir}/{id}.log"),
            ])
        }
        // The glob needs a shell; no log files yet is empty output
        None => Ok(vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("ls {dir}/*.log >/dev/null 2>&1 || exit 0; tail -n {lines} {dir}/*.log"),
        ]),
    }
}
