//! Daemon configuration.

use std::net::SocketAddr;
use std::path::PathBuf;

/// Well-known port the daemon listens on inside every sandbox.
pub const DEFAULT_DAEMON_PORT: u16 = 7420;

/// Directory holding per-task log files.
pub const DEFAULT_LOG_DIR: &str = "/var/log/boxrun";

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// gRPC bind address.
    pub bind_addr: SocketAddr,

    /// Directory for per-task log files. `None` disables file logging.
    pub log_dir: Option<PathBuf>,

    /// Agent executable.
    pub agent_program: String,

    /// Agent arguments. `{prompt}`, `{model}` and `{work_dir}` are substituted.
    pub agent_args: Vec<String>,

    /// Model used when a request does not name one.
    pub default_model: String,

    /// Capacity of each task's live broadcast channel.
    pub broadcast_capacity: usize,

    /// Finished tasks kept in memory. Older ones are dropped as new tasks
    /// finish; their log files stay on disk.
    pub max_finished_tasks: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_DAEMON_PORT)),
            log_dir: Some(PathBuf::from(DEFAULT_LOG_DIR)),
            agent_program: "claude".to_string(),
            agent_args: vec![
                "--print".to_string(),
                "{prompt}".to_string(),
                "--model".to_string(),
                "{model}".to_string(),
            ],
            default_model: "sonnet".to_string(),
            broadcast_capacity: 1024,
            max_finished_tasks: 100,
        }
    }
}

impl DaemonConfig {
    /// Config that runs each prompt as a shell script. Used by tests and for
    /// smoke-testing sandboxes without an agent installed.
    pub fn shell() -> Self {
        Self {
            agent_program: "sh".to_string(),
            agent_args: vec!["-c".to_string(), "{prompt}".to_string()],
            log_dir: None,
            ..Self::default()
        }
    }

    /// Builder method to set the bind address.
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Builder method to set the log directory.
    pub fn with_log_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.log_dir = dir;
        self
    }
}
