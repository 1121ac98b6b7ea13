//! Daemon connections.
//!
//! Every operation opens its own channel and drops it when done. There is
//! no pooling, so a stale or concurrently used connection is never reused.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tonic::transport::Channel;
use tracing::{debug, info};

use boxrun_core::SandboxRecord;
use boxrun_proto::pb::{InitRequest, InitResponse};
use boxrun_proto::AgentDaemonClient;

use crate::backend::SandboxBackend;
use crate::error::ControlError;
use crate::Result;

/// Where a sandbox's daemon listens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DaemonEndpoint {
    pub host: String,
    pub port: u16,
}

impl DaemonEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// gRPC URI for this endpoint.
    pub fn uri(&self) -> String {
        if self.host.contains(':') {
            format!("http://[{}]:{}", self.host, self.port)
        } else {
            format!("http://{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for DaemonEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uri())
    }
}

/// Daemon liveness information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DaemonInfo {
    pub version: String,
    pub hostname: String,
    pub uptime_secs: u64,
    pub active_tasks: u32,
}

impl From<InitResponse> for DaemonInfo {
    fn from(resp: InitResponse) -> Self {
        Self {
            version: resp.version,
            hostname: resp.hostname,
            uptime_secs: resp.uptime_secs,
            active_tasks: resp.active_tasks,
        }
    }
}

/// An open connection to one daemon.
pub struct DaemonConnection {
    endpoint: DaemonEndpoint,
    client: AgentDaemonClient<Channel>,
}

impl DaemonConnection {
    pub fn endpoint(&self) -> &DaemonEndpoint {
        &self.endpoint
    }

    pub fn client(&mut self) -> &mut AgentDaemonClient<Channel> {
        &mut self.client
    }
}

/// Opens connections to sandbox daemons.
#[derive(Debug, Clone)]
pub struct DaemonConnector {
    port: u16,
    connect_timeout: Duration,
}

impl DaemonConnector {
    pub fn new(port: u16, connect_timeout: Duration) -> Self {
        Self {
            port,
            connect_timeout,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Resolve where `record`'s daemon listens.
    pub async fn resolve(
        &self,
        backend: &dyn SandboxBackend,
        record: &SandboxRecord,
    ) -> Result<DaemonEndpoint> {
        backend.resolve_endpoint(record, self.port).await
    }

    /// Resolve and connect to `record`'s daemon.
    pub async fn connect(
        &self,
        backend: &dyn SandboxBackend,
        record: &SandboxRecord,
    ) -> Result<DaemonConnection> {
        let endpoint = self.resolve(backend, record).await?;
        info!(sandbox = %record.name, endpoint = %endpoint, "Connecting to daemon");
        self.connect_endpoint(endpoint).await
    }

    /// Connect to a known endpoint.
    pub async fn connect_endpoint(&self, endpoint: DaemonEndpoint) -> Result<DaemonConnection> {
        let unavailable = |reason: String| ControlError::DaemonUnavailable {
            endpoint: endpoint.to_string(),
            reason,
        };

        let channel_endpoint = Channel::from_shared(endpoint.uri())
            .map_err(|e| unavailable(e.to_string()))?
            .connect_timeout(self.connect_timeout);
        let connecting = channel_endpoint.connect();

        let channel = tokio::time::timeout(self.connect_timeout, connecting)
            .await
            .map_err(|_| unavailable(format!("timed out after {:?}", self.connect_timeout)))?
            .map_err(|e| unavailable(e.to_string()))?;

        debug!(endpoint = %endpoint, "Connected to daemon");
        Ok(DaemonConnection {
            endpoint,
            client: AgentDaemonClient::new(channel),
        })
    }

    /// Ask a connected daemon for its liveness info.
    pub async fn info(&self, conn: &mut DaemonConnection, timeout: Duration) -> Result<DaemonInfo> {
        let call = conn.client().init(InitRequest {});
        let response = tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| ControlError::rpc("init", deadline_exceeded(timeout)))?
            .map_err(|status| ControlError::rpc("init", status))?;
        Ok(response.into_inner().into())
    }
}

/// Status reported when a client-side RPC deadline passes.
pub(crate) fn deadline_exceeded(timeout: Duration) -> tonic::Status {
    tonic::Status::deadline_exceeded(format!("no response within {timeout:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn test_endpoint_uri() {
        assert_eq!(
            DaemonEndpoint::new("172.17.0.2", 7420).uri(),
            "http://172.17.0.2:7420"
        );
        assert_eq!(DaemonEndpoint::new("::1", 7420).uri(), "http://[::1]:7420");
    }

    #[tokio::test]
    async fn test_connect_failure_is_daemon_unavailable() {
        // Bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = DaemonConnector::new(port, Duration::from_secs(2));
        let err = connector
            .connect_endpoint(DaemonEndpoint::new("127.0.0.1", port))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::DaemonUnavailable);
    }
}
