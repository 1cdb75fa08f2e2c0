//! Error types for Pagetrail

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Pagetrail
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Remote Service Errors
    // =========================================================================
    /// The remote service could not be reached
    #[error("Network error: Unable to reach server ({0})")]
    RemoteConnection(#[source] reqwest::Error),

    /// The remote service answered with a failure
    #[error("Remote service rejected request ({status}): {message}")]
    RemoteRejected { status: u16, message: String },

    /// The remote response could not be decoded
    #[error("Failed to parse remote response: {0}")]
    RemoteResponseParse(String),

    // =========================================================================
    // Local State Errors
    // =========================================================================
    /// I/O error from the local state store
    #[error("Storage I/O error: {0}")]
    Storage(#[from] std::io::Error),

    /// Local blob (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // =========================================================================
    // Messaging Errors
    // =========================================================================
    /// No live listener answered a request for a context
    #[error("Context unavailable: {0}")]
    ContextUnavailable(String),

    /// A reply of the wrong kind arrived for a request
    #[error("Unexpected reply to {request}: {reply}")]
    UnexpectedReply { request: String, reply: String },

    // =========================================================================
    // General Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the error is a transient remote failure that the next sync tick will retry.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::RemoteConnection(_) => true,
            Error::RemoteRejected { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}
