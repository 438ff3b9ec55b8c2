//! Error types for the wire protocol.

use thiserror::Error;

/// A push body that does not satisfy the push schema.
///
/// Any schema error rejects the whole batch; nothing from it is applied.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    /// The body is not valid JSON.
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    /// The body is valid JSON but not an object.
    #[error("Push body must be a JSON object")]
    NotAnObject,

    /// A top-level field has the wrong type or is missing.
    #[error("{field} must be {expected}")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
    },

    /// One mutation in the batch is malformed beyond recovery.
    #[error("Mutation {index} is invalid: {reason}")]
    InvalidMutation { index: usize, reason: &'static str },
}
