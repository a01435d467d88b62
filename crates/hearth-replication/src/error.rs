//! Replication-client error types.

use thiserror::Error;

/// Errors from the replication client.
#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed replication command: {0}")]
    MalformedCommand(String),

    #[error("Not connected to the replication source")]
    NotConnected,

    #[error("Stream '{0}' is already bound")]
    StreamAlreadyBound(&'static str),

    #[error("Failed to decode row on stream '{stream}': {message}")]
    Decode { stream: String, message: String },
}
