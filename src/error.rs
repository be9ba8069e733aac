//! Error types for the stream watcher.

use crate::types::EventKind;
use thiserror::Error;

/// Main error type for watcher operations.
///
/// Every variant is cheap to clone so a single failure can be fanned out to
/// the error handler, the error listeners and the event channel.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WatchError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Stream closed unexpectedly")]
    StreamClosed,

    #[error("Handler for {kind} events failed: {message}")]
    Dispatch { kind: EventKind, message: String },

    #[error("Invalid watcher state: {0}")]
    InvalidState(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

impl WatchError {
    /// Whether this failure ends the current subscription and schedules a
    /// reconnect.
    pub fn triggers_reconnect(&self) -> bool {
        matches!(
            self,
            WatchError::Connection(_) | WatchError::Stream(_) | WatchError::StreamClosed
        )
    }
}

impl From<serde_json::Error> for WatchError {
    fn from(e: serde_json::Error) -> Self {
        WatchError::Deserialization(e.to_string())
    }
}

/// Error type returned by user handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result type returned by user handlers.
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Result type for watcher operations.
pub type Result<T> = std::result::Result<T, WatchError>;
