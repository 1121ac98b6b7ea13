//! Sandbox records, creation requests, and list filters.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::ids::SandboxId;
use crate::status::Locality;

/// Metadata keys used in [`SandboxRecord::metadata`].
pub mod meta {
    /// Runtime container id of a local sandbox.
    pub const CONTAINER_ID: &str = "container_id";
    /// Runtime container name of a local sandbox.
    pub const CONTAINER_NAME: &str = "container_name";
    /// Image the local container was created from.
    pub const IMAGE: &str = "image";
    /// Branch the sandbox was created for.
    pub const BRANCH: &str = "branch";
    /// Provider-side id of a remote sandbox.
    pub const REMOTE_ID: &str = "remote_id";
    /// Region a remote sandbox runs in.
    pub const REGION: &str = "region";
}

/// A sandbox known to the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxRecord {
    /// Unique, immutable identifier.
    pub id: SandboxId,

    /// Display name, unique within its locality.
    pub name: String,

    /// Local container or remote instance.
    pub locality: Locality,

    /// Lifecycle state as reported by the provider ("running", "stopped", ...).
    pub state: String,

    /// Locality-specific addressing data.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    /// When the sandbox was created.
    pub created_at: DateTime<Utc>,

    /// Optional group tag used for filtering.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

impl SandboxRecord {
    /// Create a new record with a generated id.
    pub fn new(name: impl Into<String>, locality: Locality) -> Self {
        Self {
            id: SandboxId::generate(),
            name: name.into(),
            locality,
            state: "created".to_string(),
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
            group: None,
        }
    }

    /// Builder method to set a specific ID (remote sandboxes, tests).
    pub fn with_id(mut self, id: impl Into<SandboxId>) -> Self {
        self.id = id.into();
        self
    }

    /// Builder method to set the lifecycle state.
    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = state.into();
        self
    }

    /// Builder method to add a metadata entry.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Builder method to set the group tag.
    pub fn with_group(mut self, group: Option<String>) -> Self {
        self.group = group;
        self
    }

    /// Look up a metadata value.
    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Returns true if `key` is this sandbox's name or id.
    pub fn matches(&self, key: &str) -> bool {
        self.name == key || self.id.as_str() == key
    }

    /// Returns true if the record belongs to `group` (no group matches all).
    pub fn in_group(&self, group: Option<&str>) -> bool {
        match group {
            None => true,
            Some(g) => self.group.as_deref() == Some(g),
        }
    }
}

/// A request to create a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxSpec {
    /// Requested name. Derived from `branch` when absent.
    pub name: Option<String>,
    /// Branch the sandbox works on.
    pub branch: Option<String>,
    /// Where to create the sandbox.
    pub locality: Option<Locality>,
    /// Container image (local) or snapshot (remote) override.
    pub image: Option<String>,
    /// Group tag.
    pub group: Option<String>,
    /// CPU cores (remote only).
    pub cpu: Option<i64>,
    /// Memory in GiB (remote only).
    pub memory_gb: Option<i64>,
    /// Disk in GiB (remote only).
    pub disk_gb: Option<i64>,
    /// Environment for the sandbox.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl SandboxSpec {
    /// Create a spec for a named sandbox.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    /// Builder method to set the locality.
    pub fn with_locality(mut self, locality: Locality) -> Self {
        self.locality = Some(locality);
        self
    }

    /// Builder method to set the branch.
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    /// Builder method to set the group tag.
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Effective locality (local unless stated otherwise).
    pub fn locality(&self) -> Locality {
        self.locality.unwrap_or(Locality::Local)
    }

    /// Check the request without touching any provider.
    pub fn validate(&self) -> Result<(), CoreError> {
        let has_name = self.name.as_deref().is_some_and(|n| !n.trim().is_empty());
        let has_branch = self.branch.as_deref().is_some_and(|b| !b.trim().is_empty());
        if !has_name && !has_branch {
            return Err(CoreError::InvalidInput(
                "either a name or a branch is required".to_string(),
            ));
        }

        if self.locality() == Locality::Remote {
            for (field, value) in [
                ("cpu", self.cpu),
                ("memory_gb", self.memory_gb),
                ("disk_gb", self.disk_gb),
            ] {
                if let Some(v) = value {
                    if v < 0 {
                        return Err(CoreError::InvalidInput(format!(
                            "{field} must not be negative (got {v})"
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    /// Name the sandbox will be registered under.
    ///
    /// Uses the explicit name when present, otherwise a slug of the branch.
    pub fn resolved_name(&self) -> Option<String> {
        if let Some(name) = self.name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            return Some(name.to_string());
        }
        self.branch
            .as_deref()
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .map(slugify)
    }
}

fn slugify(branch: &str) -> String {
    let slug: String = branch
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect();
    slug.trim_matches('-').to_string()
}

/// Which sources a sandbox listing should query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListFilter {
    /// Include local sandboxes.
    pub local: bool,
    /// Include remote sandboxes.
    pub remote: bool,
    /// Only sandboxes with this group tag.
    pub group: Option<String>,
}

impl Default for ListFilter {
    fn default() -> Self {
        Self::all()
    }
}

impl ListFilter {
    /// Both localities, no group filter.
    pub fn all() -> Self {
        Self {
            local: true,
            remote: true,
            group: None,
        }
    }

    /// Local sandboxes only.
    pub fn local_only() -> Self {
        Self {
            local: true,
            remote: false,
            group: None,
        }
    }

    /// Remote sandboxes only.
    pub fn remote_only() -> Self {
        Self {
            local: false,
            remote: true,
            group: None,
        }
    }

    /// Builder method to filter by group.
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_requires_name_or_branch() {
        assert!(SandboxSpec::default().validate().is_err());
        assert!(SandboxSpec::named("  ").validate().is_err());
        assert!(SandboxSpec::named("demo").validate().is_ok());
        assert!(SandboxSpec::default()
            .with_branch("feature/x")
            .validate()
            .is_ok());
    }

    #[test]
    fn test_negative_resources_rejected_for_remote_only() {
        let mut spec = SandboxSpec::named("demo");
        spec.memory_gb = Some(-1);
        assert!(spec.validate().is_ok());

        let spec = spec.with_locality(Locality::Remote);
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("memory_gb"));
    }

    #[test]
    fn test_resolved_name_from_branch() {
        let spec = SandboxSpec::default().with_branch("feature/login flow");
        assert_eq!(spec.resolved_name().as_deref(), Some("feature-login-flow"));

        let spec = SandboxSpec::named("explicit").with_branch("main");
        assert_eq!(spec.resolved_name().as_deref(), Some("explicit"));
    }

    #[test]
    fn test_record_matching() {
        let record = SandboxRecord::new("demo", Locality::Local).with_id("id-1");
        assert!(record.matches("demo"));
        assert!(record.matches("id-1"));
        assert!(!record.matches("other"));
        assert!(record.in_group(None));
        assert!(!record.in_group(Some("team")));
    }
}
