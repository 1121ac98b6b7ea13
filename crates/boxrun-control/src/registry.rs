//! Sandbox registry.
//!
//! The authoritative list of sandboxes: local ones come from the local
//! store, remote ones from the cloud provider. Each record is owned by
//! exactly one backend, chosen by its locality.

use std::sync::Arc;

use tracing::{debug, info, warn};

use boxrun_core::{ListFilter, Locality, SandboxRecord, SandboxSpec};

use crate::backend::SandboxBackend;
use crate::error::ControlError;
use crate::Result;

pub struct SandboxRegistry {
    local: Arc<dyn SandboxBackend>,
    remote: Option<Arc<dyn SandboxBackend>>,
}

impl SandboxRegistry {
    /// Registry over a local backend and, when configured, a remote one.
    pub fn new(local: Arc<dyn SandboxBackend>, remote: Option<Arc<dyn SandboxBackend>>) -> Self {
        Self { local, remote }
    }

    fn remote(&self) -> Result<&Arc<dyn SandboxBackend>> {
        self.remote
            .as_ref()
            .ok_or_else(|| ControlError::ProviderUnavailable {
                step: "selecting remote provider",
                reason: "no cloud provider configured (set BOXRUN_CLOUD_API_KEY)".to_string(),
            })
    }

    /// Backend owning sandboxes of `locality`.
    pub fn backend(&self, locality: Locality) -> Result<&dyn SandboxBackend> {
        match locality {
            Locality::Local => Ok(self.local.as_ref()),
            Locality::Remote => Ok(self.remote()?.as_ref()),
        }
    }

    /// Backend owning `record`.
    pub fn backend_for(&self, record: &SandboxRecord) -> Result<&dyn SandboxBackend> {
        self.backend(record.locality)
    }

    /// Create a sandbox.
    ///
    /// The request is validated before any provider is contacted.
    pub async fn create(&self, spec: &SandboxSpec) -> Result<SandboxRecord> {
        spec.validate()?;
        let name = spec.resolved_name().ok_or_else(|| {
            ControlError::ValidationFailed("sandbox name resolves to an empty string".to_string())
        })?;

        let locality = spec.locality();
        info!(sandbox = %name, %locality, "Creating sandbox");
        self.backend(locality)?.create(spec, &name).await
    }

    /// List sandboxes matching `filter`, oldest first.
    ///
    /// When both localities are requested a remote failure is logged and
    /// the local results are still returned.
    pub async fn list(&self, filter: &ListFilter) -> Result<Vec<SandboxRecord>> {
        let group = filter.group.as_deref();
        let mut records = Vec::new();

        if filter.local {
            records.extend(self.local.list(group).await?);
        }

        if filter.remote {
            let remote = match self.remote() {
                Ok(backend) => backend.list(group).await,
                Err(e) => Err(e),
            };
            match remote {
                Ok(found) => records.extend(found),
                Err(e) if filter.local => {
                    warn!(error = %e, "Remote sandboxes unavailable, showing local only");
                }
                Err(e) => return Err(e),
            }
        }

        records.retain(|r| r.in_group(group));
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    /// Find a sandbox by name or id, local first.
    pub async fn find_by_name(&self, key: &str) -> Result<SandboxRecord> {
        if let Some(record) = self.local.find(key).await? {
            return Ok(record);
        }

        if let Some(remote) = &self.remote {
            match remote.find(key).await {
                Ok(Some(record)) => return Ok(record),
                Ok(None) => {}
                Err(e) => {
                    warn!(key, error = %e, "Remote lookup failed");
                }
            }
        }

        debug!(key, "No sandbox matches");
        Err(ControlError::SandboxNotFound(key.to_string()))
    }

    /// Look up a sandbox by id only.
    pub async fn get(&self, id: &str) -> Result<SandboxRecord> {
        let record = self.find_by_name(id).await?;
        if record.id.as_str() == id {
            Ok(record)
        } else {
            Err(ControlError::SandboxNotFound(id.to_string()))
        }
    }

    /// Delete a sandbox through its backend.
    pub async fn delete(&self, key: &str, force: bool) -> Result<SandboxRecord> {
        let record = self.find_by_name(key).await?;
        info!(sandbox = %record.name, locality = %record.locality, force, "Deleting sandbox");
        self.backend_for(&record)?.delete(&record, force).await?;
        Ok(record)
    }

    /// Start a stopped sandbox.
    pub async fn start(&self, key: &str) -> Result<SandboxRecord> {
        let record = self.find_by_name(key).await?;
        info!(sandbox = %record.name, "Starting sandbox");
        self.backend_for(&record)?.start(&record).await
    }
}
