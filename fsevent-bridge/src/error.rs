//! Error types for the event bridge.

use thiserror::Error;

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, WatcherError>;

/// Errors that can occur while watching directories or reading change batches.
#[derive(Error, Debug)]
pub enum WatcherError {
    /// A path or latency value was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not valid in the current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Pipe creation, read, write or readiness wait failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The run-loop thread could not be created or died unexpectedly.
    #[error("platform error: {0}")]
    Platform(String),

    /// The notification backend refused a subscription.
    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    /// A frame read from a channel was malformed. The channel is unusable
    /// afterwards since the byte stream cannot be resynchronized.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Configuration could not be parsed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
