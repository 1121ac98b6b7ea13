//! Container runtime used by local sandboxes.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::Docker;
use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;
use thiserror::Error;
use tracing::{debug, info};

/// Label set on every container this control plane creates.
pub const MANAGED_LABEL: &str = "dev.boxrun.managed";

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container runtime unreachable: {0}")]
    Connection(String),

    #[error("container not found: {0}")]
    NotFound(String),

    #[error("container has no network address: {0}")]
    NoAddress(String),

    #[error("container runtime error: {0}")]
    Other(String),
}

impl From<bollard::errors::Error> for RuntimeError {
    fn from(err: bollard::errors::Error) -> Self {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => Self::NotFound(message),
            other => Self::Other(other.to_string()),
        }
    }
}

/// A container as returned by a name lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub state: String,
    pub created_at: DateTime<Utc>,
}

/// Parameters for a new container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: HashMap<String, String>,
    pub labels: HashMap<String, String>,
}

/// Result of a one-shot command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Operations the control plane needs from a container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Containers whose name is exactly `name`, most recently created first.
    async fn find_by_name(&self, name: &str) -> Result<Vec<ContainerSummary>, RuntimeError>;

    /// Network address the container is reachable at.
    async fn inspect_address(&self, container_id: &str) -> Result<String, RuntimeError>;

    /// Create and start a container, returning its full id.
    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn start(&self, container_id: &str) -> Result<(), RuntimeError>;

    async fn remove(&self, container_id: &str, force: bool) -> Result<(), RuntimeError>;

    /// Run a command to completion and collect its output.
    async fn exec(
        &self,
        container_id: &str,
        command: Vec<String>,
    ) -> Result<CommandOutput, RuntimeError>;
}

/// [`ContainerRuntime`] backed by the local Docker daemon.
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connect using the platform defaults (`DOCKER_HOST` or the local socket).
    pub fn connect() -> Result<Self, RuntimeError> {
        let client =
            Docker::connect_with_defaults().map_err(|e| RuntimeError::Connection(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn find_by_name(&self, name: &str) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![name.to_string()]);
        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self.client.list_containers(Some(options)).await?;

        // The name filter is a substring match
        let mut found: Vec<ContainerSummary> = containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                let exact = c
                    .names
                    .unwrap_or_default()
                    .iter()
                    .any(|n| n.trim_start_matches('/') == name);
                if !exact {
                    return None;
                }
                Some(ContainerSummary {
                    id,
                    name: name.to_string(),
                    state: c.state.unwrap_or_else(|| "unknown".to_string()),
                    created_at: c
                        .created
                        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
                        .unwrap_or_else(Utc::now),
                })
            })
            .collect();

        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        debug!(name, matches = found.len(), "Resolved containers by name");
        Ok(found)
    }

    async fn inspect_address(&self, container_id: &str) -> Result<String, RuntimeError> {
        let inspect = self
            .client
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await?;

        let settings = inspect
            .network_settings
            .ok_or_else(|| RuntimeError::NoAddress(container_id.to_string()))?;

        if let Some(ip) = settings.ip_address.filter(|ip| !ip.is_empty()) {
            return Ok(ip);
        }

        // User-defined networks leave the top-level address empty
        settings
            .networks
            .unwrap_or_default()
            .into_values()
            .filter_map(|endpoint| endpoint.ip_address)
            .find(|ip| !ip.is_empty())
            .ok_or_else(|| RuntimeError::NoAddress(container_id.to_string()))
    }

    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        info!(name = %spec.name, image = %spec.image, "Creating container");

        let mut labels = spec.labels.clone();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect()),
            labels: Some(labels),
            tty: Some(false),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let created = self.client.create_container(Some(options), config).await?;
        self.start(&created.id).await?;
        Ok(created.id)
    }

    async fn start(&self, container_id: &str) -> Result<(), RuntimeError> {
        info!(container_id, "Starting container");
        self.client
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn remove(&self, container_id: &str, force: bool) -> Result<(), RuntimeError> {
        info!(container_id, force, "Removing container");
        let options = RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        };
        self.client
            .remove_container(container_id, Some(options))
            .await?;
        Ok(())
    }

    async fn exec(
        &self,
        container_id: &str,
        command: Vec<String>,
    ) -> Result<CommandOutput, RuntimeError> {
        debug!(container_id, ?command, "Executing command in container");

        let exec = self
            .client
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(command),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        match self.client.start_exec(&exec.id, None).await? {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(chunk) = output.next().await {
                    match chunk? {
                        LogOutput::StdOut { message } | LogOutput::Console { message } => {
                            stdout.extend_from_slice(&message)
                        }
                        LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                        LogOutput::StdIn { .. } => {}
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(RuntimeError::Other("exec was detached unexpectedly".to_string()));
            }
        }

        let inspect = self.client.inspect_exec(&exec.id).await?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code: inspect.exit_code.unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_mapping() {
        let err: RuntimeError = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "No such container: abc".to_string(),
        }
        .into();
        assert!(matches!(err, RuntimeError::NotFound(_)));

        let err: RuntimeError = bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message: "boom".to_string(),
        }
        .into();
        assert!(matches!(err, RuntimeError::Other(_)));
    }

    #[test]
    fn test_command_output_success() {
        assert!(CommandOutput::default().success());
        let failed = CommandOutput {
            exit_code: 2,
            ..Default::default()
        };
        assert!(!failed.success());
    }
}
