//! Control plane configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Well-known port every sandbox daemon listens on.
pub const DAEMON_PORT: u16 = 7420;

/// Directory inside a sandbox that holds the daemon's task log files.
pub const DAEMON_LOG_DIR: &str = "/var/log/boxrun";

/// Control plane configuration.
///
/// Timeouts are layered: connect < status < create < legacy run.
#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// Directory for local state.
    pub home_dir: PathBuf,

    /// Local sandbox store document.
    pub store_path: PathBuf,

    /// How many times to try opening a locked store.
    pub store_open_attempts: u32,

    /// Base delay between store open attempts (multiplied by the attempt number).
    pub store_retry_backoff: Duration,

    /// Daemon port inside sandboxes.
    pub daemon_port: u16,

    /// Connection establishment timeout.
    pub connect_timeout: Duration,

    /// Status RPC timeout.
    pub status_timeout: Duration,

    /// Task creation RPC timeout.
    pub create_timeout: Duration,

    /// Legacy synchronous run timeout.
    pub run_timeout: Duration,

    /// Working directory for tasks in local sandboxes.
    pub local_work_dir: String,

    /// Image for new local sandboxes.
    pub default_image: String,

    /// Prefix for local container names.
    pub container_prefix: String,

    /// Model used when a task does not name one.
    pub default_model: String,

    /// Cloud provider API base URL.
    pub cloud_url: String,

    /// Cloud provider API key.
    pub cloud_api_key: Option<String>,

    /// Log directory inside sandboxes.
    pub daemon_log_dir: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        let home_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".boxrun");
        Self {
            store_path: home_dir.join("sandboxes.json"),
            home_dir,
            store_open_attempts: 5,
            store_retry_backoff: Duration::from_millis(100),
            daemon_port: DAEMON_PORT,
            connect_timeout: Duration::from_secs(5),
            status_timeout: Duration::from_secs(10),
            create_timeout: Duration::from_secs(30),
            run_timeout: Duration::from_secs(30 * 60),
            local_work_dir: "/workspace".to_string(),
            default_image: "ghcr.io/filipelabs/boxrun-sandbox:latest".to_string(),
            container_prefix: "boxrun-".to_string(),
            default_model: "sonnet".to_string(),
            cloud_url: "https://api.boxrun.dev/v1".to_string(),
            cloud_api_key: None,
            daemon_log_dir: DAEMON_LOG_DIR.to_string(),
        }
    }
}

impl ControlConfig {
    /// Defaults overridden by `BOXRUN_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(home) = std::env::var("BOXRUN_HOME") {
            config = config.with_home_dir(PathBuf::from(home));
        }
        if let Some(port) = std::env::var("BOXRUN_DAEMON_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
        {
            config.daemon_port = port;
        }
        if let Ok(url) = std::env::var("BOXRUN_CLOUD_URL") {
            config.cloud_url = url;
        }
        config.cloud_api_key = std::env::var("BOXRUN_CLOUD_API_KEY")
            .ok()
            .filter(|k| !k.is_empty());
        if let Ok(image) = std::env::var("BOXRUN_IMAGE") {
            config.default_image = image;
        }

        config
    }

    /// Builder method to relocate all local state.
    pub fn with_home_dir(mut self, home_dir: PathBuf) -> Self {
        self.store_path = home_dir.join("sandboxes.json");
        self.home_dir = home_dir;
        self
    }

    /// Builder method to set the daemon port.
    pub fn with_daemon_port(mut self, port: u16) -> Self {
        self.daemon_port = port;
        self
    }
}
