//! Agent API key resolution.
//!
//! Sources are tried in order and the first non-empty key wins:
//! 1. the `ANTHROPIC_API_KEY` environment variable
//! 2. `~/.config/boxrun/credentials` (`api_key = ...` line, or the bare key)
//! 3. the agent's own config, `~/.claude.json` (`primaryApiKey`)

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::ControlError;
use crate::Result;

pub const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

/// Where an API key was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Environment,
    CredentialsFile,
    AgentConfig,
}

/// Resolves the agent API key.
#[derive(Debug, Clone)]
pub struct CredentialResolver {
    env_var: Option<String>,
    credentials_file: Option<PathBuf>,
    agent_config: Option<PathBuf>,
}

impl Default for CredentialResolver {
    fn default() -> Self {
        let home = dirs::home_dir();
        Self {
            env_var: Some(API_KEY_ENV.to_string()),
            credentials_file: home
                .as_ref()
                .map(|h| h.join(".config").join("boxrun").join("credentials")),
            agent_config: home.map(|h| h.join(".claude.json")),
        }
    }
}

impl CredentialResolver {
    /// Resolver with explicit sources; `None` disables a source.
    pub fn new(
        env_var: Option<String>,
        credentials_file: Option<PathBuf>,
        agent_config: Option<PathBuf>,
    ) -> Self {
        Self {
            env_var,
            credentials_file,
            agent_config,
        }
    }

    /// First non-empty key and where it came from.
    pub fn resolve(&self) -> Option<(String, CredentialSource)> {
        if let Some(key) = self
            .env_var
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .and_then(non_empty)
        {
            return Some((key, CredentialSource::Environment));
        }

        if let Some(key) = self.credentials_file.as_deref().and_then(read_credentials_file) {
            return Some((key, CredentialSource::CredentialsFile));
        }

        self.agent_config
            .as_deref()
            .and_then(read_agent_config)
            .map(|key| (key, CredentialSource::AgentConfig))
    }

    /// The API key, or [`ControlError::ApiKeyMissing`].
    pub fn api_key(&self) -> Result<String> {
        let (key, source) = self.resolve().ok_or(ControlError::ApiKeyMissing)?;
        debug!(?source, "Resolved agent API key");
        Ok(key)
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn read_credentials_file(path: &Path) -> Option<String> {
    let content = fs::read_to_string(path).ok()?;

    for line in content.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            if key.trim() == "api_key" {
                return non_empty(value.trim().trim_matches('"').to_string());
            }
            continue;
        }
        return non_empty(line.to_string());
    }
    None
}

fn read_agent_config(path: &Path) -> Option<String> {
    let content = fs::read_to_string(path).ok()?;
    let value: serde_json::Value = serde_json::from_str(&content).ok()?;
    value
        .get("primaryApiKey")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .and_then(non_empty)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_env_var_wins() {
        let dir = tempfile::tempdir().unwrap();
        let creds = write(dir.path(), "credentials", "api_key = from-file\n");
        let var = "BOXRUN_TEST_KEY_ENV_WINS";
        std::env::set_var(var, "from-env");

        let resolver = CredentialResolver::new(Some(var.to_string()), Some(creds), None);
        assert_eq!(
            resolver.resolve(),
            Some(("from-env".to_string(), CredentialSource::Environment))
        );
        std::env::remove_var(var);
    }

    #[test]
    fn test_empty_env_falls_through_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let creds = write(dir.path(), "credentials", "# boxrun\napi_key = \"sk-file\"\n");
        let var = "BOXRUN_TEST_KEY_EMPTY";
        std::env::set_var(var, "  ");

        let resolver = CredentialResolver::new(Some(var.to_string()), Some(creds), None);
        assert_eq!(
            resolver.resolve(),
            Some(("sk-file".to_string(), CredentialSource::CredentialsFile))
        );
        std::env::remove_var(var);
    }

    #[test]
    fn test_bare_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let creds = write(dir.path(), "credentials", "sk-bare\n");
        let resolver = CredentialResolver::new(None, Some(creds), None);
        assert_eq!(resolver.api_key().unwrap(), "sk-bare");
    }

    #[test]
    fn test_agent_config_last() {
        let dir = tempfile::tempdir().unwrap();
        let config = write(dir.path(), ".claude.json", r#"{"primaryApiKey": "sk-agent"}"#);
        let resolver = CredentialResolver::new(
            None,
            Some(dir.path().join("missing")),
            Some(config),
        );
        assert_eq!(
            resolver.resolve(),
            Some(("sk-agent".to_string(), CredentialSource::AgentConfig))
        );
    }

    #[test]
    fn test_nothing_found() {
        let dir = tempfile::tempdir().unwrap();
        let config = write(dir.path(), ".claude.json", r#"{"primaryApiKey": ""}"#);
        let resolver = CredentialResolver::new(None, None, Some(config));
        assert!(matches!(resolver.api_key(), Err(ControlError::ApiKeyMissing)));
    }
}
