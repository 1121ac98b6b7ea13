//! boxrun Control Plane Library
//!
//! The orchestration layer between callers and sandbox daemons:
//! - [`registry`]: which sandboxes exist, backed by a file-locked local store
//!   and a cloud provider
//! - [`connector`]: turning a sandbox record into a daemon connection
//! - [`orchestrator`]: creating tasks and observing their lifecycle
//! - [`relay`]: forwarding a daemon's live log stream to a caller

pub mod backend;
pub mod cloud;
pub mod config;
pub mod connector;
pub mod control;
pub mod credentials;
pub mod error;
pub mod orchestrator;
pub mod registry;
pub mod relay;
pub mod runtime;
pub mod store;

pub use config::ControlConfig;
pub use connector::{DaemonConnector, DaemonEndpoint};
pub use control::ControlPlane;
pub use error::{ControlError, ErrorKind};
pub use orchestrator::TaskOrchestrator;
pub use registry::SandboxRegistry;
pub use relay::{LogRelay, LogSink, RelayOutcome, StreamRequest};
pub use store::{LocalStore, StoreHandle};

/// Result alias for control plane operations.
pub type Result<T> = std::result::Result<T, ControlError>;
