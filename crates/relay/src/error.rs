//! Error types for the relay crate.

use crate::auth::AuthError;
use crate::config::ConfigError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use protocol::{ErrorBody, SchemaError};
use thiserror::Error;

/// Result type alias for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;

/// Errors surfaced by the relay.
#[derive(Error, Debug)]
pub enum RelayError {
    /// The request body does not match the wire schema.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// Bearer token missing or rejected.
    #[error("Unauthorized - {}", unauthorized_reason(.0))]
    Unauthorized(AuthError),

    /// The token is valid but names a different user than the request.
    #[error("Forbidden - token does not match userId")]
    Forbidden,

    /// A required query parameter is absent.
    #[error("Missing required parameter: {0}")]
    MissingParameter(&'static str),

    /// Failed to bind the listening socket.
    #[error("Failed to bind to {0}: {1}")]
    Bind(String, #[source] std::io::Error),

    /// Serving failed after the listener was bound.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<AuthError> for RelayError {
    fn from(e: AuthError) -> Self {
        RelayError::Unauthorized(e)
    }
}

fn unauthorized_reason(e: &AuthError) -> &'static str {
    match e {
        AuthError::Missing => "No token provided",
        _ => "Invalid or expired token",
    }
}

impl RelayError {
    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::Schema(_) | RelayError::MissingParameter(_) => StatusCode::BAD_REQUEST,
            RelayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            RelayError::Forbidden => StatusCode::FORBIDDEN,
            RelayError::Bind(..) | RelayError::Io(_) | RelayError::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        (self.status(), Json(ErrorBody::new(self.to_string()))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unauthorized_messages() {
        assert_eq!(
            RelayError::from(AuthError::Expired).to_string(),
            "Unauthorized - Invalid or expired token"
        );
        assert_eq!(
            RelayError::from(AuthError::BadSignature).to_string(),
            "Unauthorized - Invalid or expired token"
        );
        assert_eq!(
            RelayError::from(AuthError::Missing).to_string(),
            "Unauthorized - No token provided"
        );
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            RelayError::from(SchemaError::NotAnObject).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            RelayError::MissingParameter("userId").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            RelayError::from(AuthError::Expired).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(RelayError::Forbidden.status(), StatusCode::FORBIDDEN);
    }
}
