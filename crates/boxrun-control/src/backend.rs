//! Locality-specific sandbox operations.
//!
//! A [`SandboxBackend`] is picked once per resolved sandbox record, so
//! callers never branch on locality themselves.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use boxrun_core::sandbox::meta;
use boxrun_core::{Locality, SandboxRecord, SandboxSpec};

use crate::cloud::{CloudApi, CreateRemoteSandbox, RemoteSandbox, GROUP_LABEL};
use crate::connector::DaemonEndpoint;
use crate::error::ControlError;
use crate::runtime::{CommandOutput, ContainerRuntime, ContainerSpec, RuntimeError};
use crate::store::StoreHandle;
use crate::Result;

/// Full length of a Docker container id.
pub const FULL_CONTAINER_ID_LEN: usize = 64;

/// Operations that differ between local and remote sandboxes.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    fn locality(&self) -> Locality;

    /// Provision a sandbox named `name`.
    async fn create(&self, spec: &SandboxSpec, name: &str) -> Result<SandboxRecord>;

    async fn list(&self, group: Option<&str>) -> Result<Vec<SandboxRecord>>;

    /// Find a sandbox by name or id.
    async fn find(&self, key: &str) -> Result<Option<SandboxRecord>>;

    async fn delete(&self, record: &SandboxRecord, force: bool) -> Result<()>;

    /// Start a stopped sandbox and return its refreshed record.
    async fn start(&self, record: &SandboxRecord) -> Result<SandboxRecord>;

    /// Address of the sandbox's daemon.
    async fn resolve_endpoint(&self, record: &SandboxRecord, port: u16)
        -> Result<DaemonEndpoint>;

    /// Run a one-shot command inside the sandbox.
    async fn execute_command(
        &self,
        record: &SandboxRecord,
        command: Vec<String>,
    ) -> Result<CommandOutput>;

    /// Directory tasks run in.
    async fn work_dir(&self, record: &SandboxRecord) -> Result<String>;
}

/// Settings for [`LocalBackend`].
#[derive(Debug, Clone)]
pub struct LocalSettings {
    pub image: String,
    pub container_prefix: String,
    pub work_dir: String,
}

impl LocalSettings {
    /// Container name for a local sandbox.
    pub fn container_name(&self, sandbox_name: &str) -> String {
        format!("{}{}", self.container_prefix, sandbox_name)
    }
}

/// Containers on the local runtime, recorded in the local store.
pub struct LocalBackend {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<StoreHandle>,
    settings: LocalSettings,
}

impl LocalBackend {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<StoreHandle>,
        settings: LocalSettings,
    ) -> Self {
        Self {
            runtime,
            store,
            settings,
        }
    }

    fn container_ref(record: &SandboxRecord) -> Result<&str> {
        record
            .meta(meta::CONTAINER_ID)
            .or_else(|| record.meta(meta::CONTAINER_NAME))
            .ok_or_else(|| ControlError::ProviderUnavailable {
                step: "resolving container",
                reason: format!("sandbox '{}' has no container reference", record.name),
            })
    }

    /// Id of the live container, re-resolved by name when the stored id is truncated.
    async fn live_container_id(&self, record: &SandboxRecord) -> Result<String> {
        if let Some(id) = record
            .meta(meta::CONTAINER_ID)
            .filter(|id| id.len() >= FULL_CONTAINER_ID_LEN)
        {
            return Ok(id.to_string());
        }

        let name = record
            .meta(meta::CONTAINER_NAME)
            .map(str::to_string)
            .unwrap_or_else(|| self.settings.container_name(&record.name));
        debug!(sandbox = %record.name, container = %name, "Re-resolving container by name");

        let found = self
            .runtime
            .find_by_name(&name)
            .await
            .map_err(|e| ControlError::runtime("resolving container", e))?;
        found
            .into_iter()
            .next()
            .map(|c| c.id)
            .ok_or_else(|| ControlError::SandboxNotFound(format!("container {name}")))
    }
}

#[async_trait]
impl SandboxBackend for LocalBackend {
    fn locality(&self) -> Locality {
        Locality::Local
    }

    async fn create(&self, spec: &SandboxSpec, name: &str) -> Result<SandboxRecord> {
        let exists = self.store.with_store(|s| Ok(s.get_by_name(name))).await?;
        if exists.is_some() {
            return Err(ControlError::ValidationFailed(format!(
                "sandbox name '{name}' already exists"
            )));
        }

        let container_name = self.settings.container_name(name);
        let image = spec
            .image
            .clone()
            .unwrap_or_else(|| self.settings.image.clone());

        let mut labels = HashMap::new();
        labels.insert("boxrun.sandbox".to_string(), name.to_string());
        if let Some(group) = &spec.group {
            labels.insert(GROUP_LABEL.to_string(), group.clone());
        }

        let container_id = self
            .runtime
            .create_and_start(&ContainerSpec {
                name: container_name.clone(),
                image: image.clone(),
                env: spec.env.clone(),
                labels,
            })
            .await
            .map_err(|e| ControlError::runtime("creating container", e))?;

        let mut record = SandboxRecord::new(name, Locality::Local)
            .with_state("running")
            .with_meta(meta::CONTAINER_ID, container_id.clone())
            .with_meta(meta::CONTAINER_NAME, container_name)
            .with_meta(meta::IMAGE, image)
            .with_group(spec.group.clone());
        if let Some(branch) = &spec.branch {
            record = record.with_meta(meta::BRANCH, branch.clone());
        }

        let stored = record.clone();
        if let Err(e) = self.store.with_store(move |s| s.insert(stored)).await {
            warn!(sandbox = %name, error = %e, "Failed to record sandbox, removing container");
            if let Err(cleanup) = self.runtime.remove(&container_id, true).await {
                warn!(container_id = %container_id, error = %cleanup, "Cleanup failed");
            }
            return Err(e.into());
        }

        info!(sandbox = %name, id = %record.id, "Created local sandbox");
        Ok(record)
    }

    async fn list(&self, group: Option<&str>) -> Result<Vec<SandboxRecord>> {
        let records = match group {
            Some(g) => self.store.with_store(|s| Ok(s.list_by_group(g))).await?,
            None => self.store.with_store(|s| Ok(s.list())).await?,
        };
        Ok(records)
    }

    async fn find(&self, key: &str) -> Result<Option<SandboxRecord>> {
        let record = self
            .store
            .with_store(|s| Ok(s.get_by_name(key).or_else(|| s.get_by_id(key))))
            .await?;
        Ok(record)
    }

    async fn delete(&self, record: &SandboxRecord, force: bool) -> Result<()> {
        let container = Self::container_ref(record)?;
        match self.runtime.remove(container, force).await {
            Ok(()) => {}
            Err(RuntimeError::NotFound(_)) => {
                warn!(sandbox = %record.name, container, "Container already gone");
            }
            Err(e) => return Err(ControlError::runtime("removing container", e)),
        }

        let id = record.id.as_str().to_string();
        self.store.with_store(move |s| s.delete(&id)).await?;
        info!(sandbox = %record.name, "Deleted local sandbox");
        Ok(())
    }

    async fn start(&self, record: &SandboxRecord) -> Result<SandboxRecord> {
        let container = Self::container_ref(record)?;
        self.runtime
            .start(container)
            .await
            .map_err(|e| ControlError::runtime("starting container", e))?;

        let updated = record.clone().with_state("running");
        let stored = updated.clone();
        self.store.with_store(move |s| s.update(stored)).await?;
        Ok(updated)
    }

    async fn resolve_endpoint(
        &self,
        record: &SandboxRecord,
        port: u16,
    ) -> Result<DaemonEndpoint> {
        let container_id = self.live_container_id(record).await?;
        let host = self
            .runtime
            .inspect_address(&container_id)
            .await
            .map_err(|e| ControlError::runtime("inspecting container", e))?;
        Ok(DaemonEndpoint::new(host, port))
    }

    async fn execute_command(
        &self,
        record: &SandboxRecord,
        command: Vec<String>,
    ) -> Result<CommandOutput> {
        let container = Self::container_ref(record)?;
        self.runtime
            .exec(container, command)
            .await
            .map_err(|e| ControlError::runtime("executing command", e))
    }

    async fn work_dir(&self, _record: &SandboxRecord) -> Result<String> {
        Ok(self.settings.work_dir.clone())
    }
}

/// Sandboxes hosted by the cloud provider.
pub struct RemoteBackend {
    cloud: Arc<dyn CloudApi>,
}

impl RemoteBackend {
    pub fn new(cloud: Arc<dyn CloudApi>) -> Self {
        Self { cloud }
    }

    fn remote_id(record: &SandboxRecord) -> &str {
        record.meta(meta::REMOTE_ID).unwrap_or(record.id.as_str())
    }
}

fn remote_record(sandbox: RemoteSandbox) -> SandboxRecord {
    let group = sandbox.group().map(str::to_string);
    let mut record = SandboxRecord::new(sandbox.name, Locality::Remote)
        .with_id(sandbox.id.clone())
        .with_state(sandbox.state)
        .with_meta(meta::REMOTE_ID, sandbox.id)
        .with_group(group);
    if let Some(branch) = sandbox.labels.get("boxrun.branch") {
        record = record.with_meta(meta::BRANCH, branch.clone());
    }
    if let Some(region) = sandbox.region {
        record = record.with_meta(meta::REGION, region);
    }
    record.created_at = sandbox.created_at;
    record
}

#[async_trait]
impl SandboxBackend for RemoteBackend {
    fn locality(&self) -> Locality {
        Locality::Remote
    }

    async fn create(&self, spec: &SandboxSpec, name: &str) -> Result<SandboxRecord> {
        let mut labels = HashMap::new();
        if let Some(group) = &spec.group {
            labels.insert(GROUP_LABEL.to_string(), group.clone());
        }
        if let Some(branch) = &spec.branch {
            labels.insert("boxrun.branch".to_string(), branch.clone());
        }

        let request = CreateRemoteSandbox {
            name: name.to_string(),
            snapshot: spec.image.clone(),
            cpu: spec.cpu,
            memory_gb: spec.memory_gb,
            disk_gb: spec.disk_gb,
            env: spec.env.clone(),
            labels,
        };
        let created = self
            .cloud
            .create(&request)
            .await
            .map_err(|e| ControlError::cloud("creating remote sandbox", e))?;

        info!(sandbox = %name, id = %created.id, "Created remote sandbox");
        Ok(remote_record(created))
    }

    async fn list(&self, group: Option<&str>) -> Result<Vec<SandboxRecord>> {
        let sandboxes = self
            .cloud
            .list()
            .await
            .map_err(|e| ControlError::cloud("listing remote sandboxes", e))?;
        Ok(sandboxes
            .into_iter()
            .map(remote_record)
            .filter(|r| r.in_group(group))
            .collect())
    }

    async fn find(&self, key: &str) -> Result<Option<SandboxRecord>> {
        Ok(self.list(None).await?.into_iter().find(|r| r.matches(key)))
    }

    async fn delete(&self, record: &SandboxRecord, force: bool) -> Result<()> {
        self.cloud
            .delete(Self::remote_id(record), force)
            .await
            .map_err(|e| ControlError::cloud("deleting remote sandbox", e))?;
        info!(sandbox = %record.name, "Deleted remote sandbox");
        Ok(())
    }

    async fn start(&self, record: &SandboxRecord) -> Result<SandboxRecord> {
        let id = Self::remote_id(record);
        self.cloud
            .start(id)
            .await
            .map_err(|e| ControlError::cloud("starting remote sandbox", e))?;
        let refreshed = self
            .cloud
            .get(id)
            .await
            .map_err(|e| ControlError::cloud("refreshing remote sandbox", e))?;
        Ok(remote_record(refreshed))
    }

    async fn resolve_endpoint(
        &self,
        record: &SandboxRecord,
        _port: u16,
    ) -> Result<DaemonEndpoint> {
        Err(ControlError::SystemUnavailable(format!(
            "remote daemon connectivity is not yet supported (sandbox '{}')",
            record.name
        )))
    }

    async fn execute_command(
        &self,
        record: &SandboxRecord,
        command: Vec<String>,
    ) -> Result<CommandOutput> {
        self.cloud
            .exec(Self::remote_id(record), &command)
            .await
            .map_err(|e| ControlError::cloud("executing remote command", e))
    }

    async fn work_dir(&self, record: &SandboxRecord) -> Result<String> {
        self.cloud
            .work_dir(Self::remote_id(record))
            .await
            .map_err(|e| ControlError::cloud("querying remote work dir", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::runtime::ContainerSummary;

    #[derive(Default)]
    struct FakeRuntime {
        containers: Mutex<Vec<ContainerSummary>>,
        lookups: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn find_by_name(
            &self,
            name: &str,
        ) -> std::result::Result<Vec<ContainerSummary>, RuntimeError> {
            self.lookups.lock().unwrap().push(name.to_string());
            let mut found: Vec<_> = self
                .containers
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.name == name)
                .cloned()
                .collect();
            found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(found)
        }

        async fn inspect_address(
            &self,
            container_id: &str,
        ) -> std::result::Result<String, RuntimeError> {
            Ok(format!("addr-of-{container_id}"))
        }

        async fn create_and_start(
            &self,
            spec: &ContainerSpec,
        ) -> std::result::Result<String, RuntimeError> {
            let id = format!("{:0>64}", self.containers.lock().unwrap().len() + 1);
            self.containers.lock().unwrap().push(ContainerSummary {
                id: id.clone(),
                name: spec.name.clone(),
                state: "running".to_string(),
                created_at: chrono::Utc::now(),
            });
            Ok(id)
        }

        async fn start(&self, _container_id: &str) -> std::result::Result<(), RuntimeError> {
            Ok(())
        }

        async fn remove(
            &self,
            container_id: &str,
            _force: bool,
        ) -> std::result::Result<(), RuntimeError> {
            let mut containers = self.containers.lock().unwrap();
            let before = containers.len();
            containers.retain(|c| c.id != container_id);
            if containers.len() == before {
                return Err(RuntimeError::NotFound(container_id.to_string()));
            }
            Ok(())
        }

        async fn exec(
            &self,
            _container_id: &str,
            command: Vec<String>,
        ) -> std::result::Result<CommandOutput, RuntimeError> {
            Ok(CommandOutput {
                stdout: command.join(" "),
                ..Default::default()
            })
        }
    }

    fn backend(dir: &std::path::Path) -> (LocalBackend, Arc<FakeRuntime>) {
        let runtime = Arc::new(FakeRuntime::default());
        let store = Arc::new(StoreHandle::new(
            dir.join("sandboxes.json"),
            1,
            Duration::from_millis(1),
        ));
        let backend = LocalBackend::new(
            runtime.clone(),
            store,
            LocalSettings {
                image: "img".to_string(),
                container_prefix: "boxrun-".to_string(),
                work_dir: "/workspace".to_string(),
            },
        );
        (backend, runtime)
    }

    #[tokio::test]
    async fn test_truncated_id_is_re_resolved_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, runtime) = backend(dir.path());
        let record = backend
            .create(&SandboxSpec::named("demo"), "demo")
            .await
            .unwrap();
        let full_id = record.meta(meta::CONTAINER_ID).unwrap().to_string();

        // Full id is used as-is
        let endpoint = backend.resolve_endpoint(&record, 7420).await.unwrap();
        assert_eq!(endpoint.host, format!("addr-of-{full_id}"));
        assert!(runtime.lookups.lock().unwrap().is_empty());

        let truncated = record
            .clone()
            .with_meta(meta::CONTAINER_ID, full_id[..12].to_string());
        let endpoint = backend.resolve_endpoint(&truncated, 7420).await.unwrap();
        assert_eq!(endpoint.host, format!("addr-of-{full_id}"));
        assert_eq!(endpoint.port, 7420);
        assert_eq!(
            runtime.lookups.lock().unwrap().as_slice(),
            ["boxrun-demo".to_string()]
        );
    }

    #[tokio::test]
    async fn test_duplicate_local_name_rejected_before_container_created() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, runtime) = backend(dir.path());
        backend
            .create(&SandboxSpec::named("demo"), "demo")
            .await
            .unwrap();
        let err = backend
            .create(&SandboxSpec::named("demo"), "demo")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ValidationFailed);
        assert_eq!(runtime.containers.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_tolerates_missing_container() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, runtime) = backend(dir.path());
        let record = backend
            .create(&SandboxSpec::named("demo"), "demo")
            .await
            .unwrap();
        runtime.containers.lock().unwrap().clear();

        backend.delete(&record, true).await.unwrap();
        assert!(backend.find("demo").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_work_dir_and_exec() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, _runtime) = backend(dir.path());
        let record = backend
            .create(&SandboxSpec::named("demo"), "demo")
            .await
            .unwrap();
        assert_eq!(backend.work_dir(&record).await.unwrap(), "/workspace");
        let out = backend
            .execute_command(&record, vec!["tail".to_string(), "-n".to_string()])
            .await
            .unwrap();
        assert_eq!(out.stdout, "tail -n");
    }
}
