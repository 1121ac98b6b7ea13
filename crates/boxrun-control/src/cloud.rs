//! Cloud provider client for remote sandboxes.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::runtime::CommandOutput;

/// Label the group tag is stored under on remote sandboxes.
pub const GROUP_LABEL: &str = "boxrun.group";

/// Classified cloud provider failures.
#[derive(Debug, Error)]
pub enum CloudError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("cloud provider error: {0}")]
    Other(String),
}

impl CloudError {
    fn from_status(status: StatusCode, body: String) -> Self {
        match status {
            StatusCode::UNAUTHORIZED => Self::Auth(body),
            StatusCode::FORBIDDEN => Self::Forbidden(body),
            StatusCode::NOT_FOUND => Self::NotFound(body),
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => Self::BadRequest(body),
            other => Self::Other(format!("HTTP {other}: {body}")),
        }
    }
}

impl From<reqwest::Error> for CloudError {
    fn from(err: reqwest::Error) -> Self {
        Self::Other(err.to_string())
    }
}

/// A sandbox as reported by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteSandbox {
    pub id: String,
    pub name: String,
    pub state: String,
    #[serde(default)]
    pub region: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl RemoteSandbox {
    pub fn group(&self) -> Option<&str> {
        self.labels.get(GROUP_LABEL).map(String::as_str)
    }
}

/// Create request body.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CreateRemoteSandbox {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_gb: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_gb: Option<i64>,
    pub env: HashMap<String, String>,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
struct ExecBody<'a> {
    command: &'a [String],
}

#[derive(Debug, Deserialize)]
struct ExecReply {
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    exit_code: i64,
}

#[derive(Debug, Deserialize)]
struct WorkDirReply {
    path: String,
}

/// Operations the control plane needs from a cloud sandbox provider.
#[async_trait]
pub trait CloudApi: Send + Sync {
    async fn create(&self, request: &CreateRemoteSandbox) -> Result<RemoteSandbox, CloudError>;
    async fn list(&self) -> Result<Vec<RemoteSandbox>, CloudError>;
    async fn get(&self, id: &str) -> Result<RemoteSandbox, CloudError>;
    async fn start(&self, id: &str) -> Result<(), CloudError>;
    async fn delete(&self, id: &str, force: bool) -> Result<(), CloudError>;

    /// Run a one-shot command inside the sandbox.
    async fn exec(&self, id: &str, command: &[String]) -> Result<CommandOutput, CloudError>;

    /// Write `content` to `path` inside the sandbox.
    async fn upload_file(&self, id: &str, path: &str, content: Vec<u8>) -> Result<(), CloudError>;

    /// Working directory tasks should run in.
    async fn work_dir(&self, id: &str) -> Result<String, CloudError>;
}

/// [`CloudApi`] over the provider's REST API.
pub struct HttpCloudClient {
    inner: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpCloudClient {
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Self {
        Self {
            inner: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        debug!(%method, url = %url, "Cloud API request");
        self.inner.request(method, url).bearer_auth(&self.api_key)
    }

    async fn send(&self, builder: RequestBuilder) -> Result<reqwest::Response, CloudError> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(CloudError::from_status(status, body))
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, CloudError> {
        self.send(builder)
            .await?
            .json()
            .await
            .map_err(|e| CloudError::Other(format!("invalid response body: {e}")))
    }
}

#[async_trait]
impl CloudApi for HttpCloudClient {
    async fn create(&self, request: &CreateRemoteSandbox) -> Result<RemoteSandbox, CloudError> {
        self.send_json(self.request(Method::POST, "/sandboxes").json(request))
            .await
    }

    async fn list(&self) -> Result<Vec<RemoteSandbox>, CloudError> {
        self.send_json(self.request(Method::GET, "/sandboxes")).await
    }

    async fn get(&self, id: &str) -> Result<RemoteSandbox, CloudError> {
        self.send_json(self.request(Method::GET, &format!("/sandboxes/{id}")))
            .await
    }

    async fn start(&self, id: &str) -> Result<(), CloudError> {
        self.send(self.request(Method::POST, &format!("/sandboxes/{id}/start")))
            .await?;
        Ok(())
    }

    async fn delete(&self, id: &str, force: bool) -> Result<(), CloudError> {
        let builder = self
            .request(Method::DELETE, &format!("/sandboxes/{id}"))
            .query(&[("force", force)]);
        self.send(builder).await?;
        Ok(())
    }

    async fn exec(&self, id: &str, command: &[String]) -> Result<CommandOutput, CloudError> {
        let reply: ExecReply = self
            .send_json(
                self.request(Method::POST, &format!("/sandboxes/{id}/exec"))
                    .json(&ExecBody { command }),
            )
            .await?;
        Ok(CommandOutput {
            stdout: reply.stdout,
            stderr: reply.stderr,
            exit_code: reply.exit_code,
        })
    }

    async fn upload_file(&self, id: &str, path: &str, content: Vec<u8>) -> Result<(), CloudError> {
        let builder = self
            .request(Method::PUT, &format!("/sandboxes/{id}/files"))
            .query(&[("path", path)])
            .body(content);
        self.send(builder).await?;
        Ok(())
    }

    async fn work_dir(&self, id: &str) -> Result<String, CloudError> {
        let reply: WorkDirReply = self
            .send_json(self.request(Method::GET, &format!("/sandboxes/{id}/workdir")))
            .await?;
        Ok(reply.path)
    }
}
