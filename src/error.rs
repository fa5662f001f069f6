/// Unified error types for the test user service
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the service
#[derive(Error, Debug)]
pub enum PtuError {
    /// Key-value store errors
    #[error("Store error: {0}")]
    Store(String),

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Remote account creation failed
    #[error("Registration failed: {0}")]
    Registration(String),

    /// Verification did not complete before the deadline
    #[error("Timed out waiting for {email}")]
    Timeout { email: String },

    /// Cancellation with a password that does not match the stored one
    #[error("Username and password do not match")]
    AuthMismatch,

    /// Assertion request with a password that does not match the stored one
    #[error("Email and password don't match")]
    CredentialMismatch,

    /// Required caller input absent or unusable
    #[error("Required param missing: {0}")]
    MissingParameter(String),

    /// IdP authentication, certification or cancellation errors
    #[error("IdP error: {0}")]
    Idp(String),

    /// Key generation or assertion signing errors
    #[error("Signing error: {0}")]
    Signing(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Internal server errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PtuError {
    /// Stable machine-readable code for the error kind
    pub fn code(&self) -> &'static str {
        match self {
            PtuError::Store(_) => "StoreError",
            PtuError::NotFound(_) => "NotFound",
            PtuError::Registration(_) => "RegistrationError",
            PtuError::Timeout { .. } => "Timeout",
            PtuError::AuthMismatch => "AuthMismatch",
            PtuError::CredentialMismatch => "CredentialMismatch",
            PtuError::MissingParameter(_) => "MissingParameter",
            PtuError::Idp(_) => "IdpError",
            PtuError::Signing(_) => "SigningError",
            PtuError::Validation(_) => "InvalidRequest",
            PtuError::Internal(_) | PtuError::Io(_) => "InternalServerError",
        }
    }
}

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// Convert PtuError to HTTP response
impl IntoResponse for PtuError {
    fn into_response(self) -> Response {
        let status = match self {
            PtuError::AuthMismatch | PtuError::CredentialMismatch => StatusCode::UNAUTHORIZED,
            PtuError::MissingParameter(_) | PtuError::Validation(_) => StatusCode::BAD_REQUEST,
            PtuError::NotFound(_) => StatusCode::NOT_FOUND,
            PtuError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            PtuError::Registration(_) | PtuError::Idp(_) => StatusCode::BAD_GATEWAY,
            PtuError::Store(_)
            | PtuError::Signing(_)
            | PtuError::Internal(_)
            | PtuError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let message = match self {
            PtuError::Internal(_) | PtuError::Io(_) => "Internal server error".to_string(), // Don't leak details
            _ => self.to_string(),
        };

        let body = Json(ErrorResponse {
            error: self.code().to_string(),
            message,
        });

        (status, body).into_response()
    }
}

/// Result type alias for service operations
pub type PtuResult<T> = Result<T, PtuError>;
