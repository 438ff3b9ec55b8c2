//! Error types for the replica crate.

use thiserror::Error;

/// Local store errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A stored value does not decode as the requested record type.
    #[error("Failed to decode {key}: {reason}")]
    Decode { key: String, reason: String },

    /// A record could not be encoded for storage.
    #[error("Failed to encode {key}: {reason}")]
    Encode { key: String, reason: String },
}

/// Errors reported by a mutator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MutatorError {
    /// No mutator is registered under this name.
    #[error("Unknown mutator: {0}")]
    UnknownMutator(String),

    /// The arguments do not fit the mutator.
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    /// The record the mutator targets does not exist.
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors talking to the relay or the pull backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The request never produced a response.
    #[error("Request failed: {0}")]
    Request(String),

    /// The server answered with a non-success status.
    #[error("Server returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The response body did not match the expected shape.
    #[error("Failed to decode response: {0}")]
    Decode(String),

    /// The notification stream broke.
    #[error("Stream error: {0}")]
    Stream(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            TransportError::Decode(e.to_string())
        } else {
            TransportError::Request(e.to_string())
        }
    }
}

/// Errors surfaced by [`Replica`](crate::Replica) operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplicaError {
    #[error(transparent)]
    Mutator(#[from] MutatorError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Result type alias for replica operations.
pub type ReplicaResult<T> = Result<T, ReplicaError>;
