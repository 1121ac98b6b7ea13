//! boxrun Agent Daemon Library
//!
//! The daemon runs inside a sandbox, accepts tasks over gRPC, runs the
//! coding agent as a subprocess for each one, and keeps the output so it can
//! be replayed or followed by the control plane.

pub mod config;
pub mod error;
pub mod executor;
pub mod service;
pub mod tasks;

pub use config::DaemonConfig;
pub use error::DaemonError;
pub use executor::{AgentCommand, AgentRunner};
pub use service::DaemonService;
pub use tasks::TaskTable;
