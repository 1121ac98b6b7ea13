//! Generated gRPC code and converters for the boxrun agent daemon.
//!
//! This crate contains:
//! - Generated protobuf message types
//! - Generated gRPC service stubs (client and server)
//! - Converters between proto types and domain types

pub mod convert;

/// Generated protobuf types and services.
pub mod pb {
    // The path matches the proto package: boxrun.v1
    include!("gen/boxrun.v1.rs");
}

// Re-export commonly used types
pub use pb::agent_daemon_client::AgentDaemonClient;
pub use pb::agent_daemon_server::{AgentDaemon, AgentDaemonServer};
