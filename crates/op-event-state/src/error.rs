//! Error types for op-event-state
//!
//! Event processing never fails: malformed events are dropped and counted.
//! These errors only surface from decoding, configuration, snapshots and
//! metrics registration.

use thiserror::Error;

/// Main error type for event-state operations
#[derive(Error, Debug)]
pub enum StateError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, StateError>;

impl StateError {
    /// Create an invalid event error
    pub fn invalid_event(msg: impl Into<String>) -> Self {
        StateError::InvalidEvent(msg.into())
    }

    /// Create an invalid configuration error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        StateError::InvalidConfig(msg.into())
    }
}
