//! Federation-specific error types.

use thiserror::Error;

/// A failed delivery attempt to one destination.
///
/// Variants map one-to-one onto the failure taxonomy the backoff classifier
/// consumes; see [`crate::backoff::classify`].
#[derive(Debug, Error)]
pub enum SendError {
    #[error("Connection to '{0}' refused")]
    ConnectionRefused(String),

    #[error("Request to '{0}' timed out")]
    Timeout(String),

    #[error("'{0}' is not a valid destination")]
    InvalidDestination(String),

    #[error("Malformed response from '{destination}': {message}")]
    MalformedResponse { destination: String, message: String },

    #[error("Destination '{0}' refuses to federate with us")]
    FederationDenied(String),

    /// The transaction could not be serialised locally. Retrying cannot help
    /// and the destination is not at fault.
    #[error("Failed to encode transaction for '{destination}': {message}")]
    Encode { destination: String, message: String },

    /// A non-2xx HTTP response with a (possibly empty) structured error body.
    #[error("Remote returned {status} ({errcode}): {message}")]
    Http {
        status: u16,
        errcode: String,
        message: String,
        /// Retry hint from a rate-limit response, if the remote supplied one.
        retry_after_ms: Option<u64>,
    },
}

/// Errors from the federation pipeline outside the per-attempt send path.
#[derive(Debug, Error)]
pub enum FederationError {
    #[error("Failed to load signing key: {0}")]
    KeyLoad(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store error: {0}")]
    Store(#[from] hearth_store::StoreError),

    #[error(transparent)]
    Send(#[from] SendError),
}
