//! Core domain errors.

use thiserror::Error;

/// Core domain errors for boxrun.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    /// Invalid task state transition.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Unknown enum value received from a peer.
    #[error("Unknown {kind}: {value}")]
    UnknownValue { kind: &'static str, value: String },

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
