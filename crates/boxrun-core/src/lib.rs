//! boxrun Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network/gRPC
//! - Storage
//! - Container runtimes or cloud providers
//!
//! Everything here describes sandboxes, agent tasks running inside them,
//! and the log events those tasks produce.

pub mod error;
pub mod event;
pub mod ids;
pub mod sandbox;
pub mod status;
pub mod task;

// Re-export commonly used types
pub use error::CoreError;
pub use event::LogEvent;
pub use ids::{SandboxId, TaskId};
pub use sandbox::{ListFilter, SandboxRecord, SandboxSpec};
pub use status::{Locality, LogEventType, TaskState};
pub use task::{RunOutput, TaskRecord};
