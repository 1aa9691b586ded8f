//! Error types shared by the reconciliation primitives.

use thiserror::Error;

use crate::classify::Classify;

/// Result type alias for calls against the remote system.
pub type Result<T> = std::result::Result<T, RemoteError>;

/// HTTP status the backend uses for "no such entity".
pub const STATUS_NOT_FOUND: u16 = 404;

/// Errors returned by a remote call.
///
/// Only the structural attributes (status code, error code token, message)
/// matter to the rest of the crate; classification never depends on which
/// transport produced the error.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    /// API error response from the remote service
    #[error("API error ({status}): {message}")]
    Api {
        status: u16,
        code: Option<String>,
        message: String,
    },

    /// The request never produced a response (connect, timeout, decode)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Invalid request (missing required data, etc.)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl RemoteError {
    /// Create an API error from status and message
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            code: None,
            message: message.into(),
        }
    }

    /// Create an API error that also carries the backend's error code token.
    pub fn api_with_code(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            code: Some(code.into()),
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::api(STATUS_NOT_FOUND, message)
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Create an invalid request error
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// True when the remote system reported the entity as missing.
    pub fn is_not_found(&self) -> bool {
        self.status_code() == Some(STATUS_NOT_FOUND)
    }
}

impl Classify for RemoteError {
    fn status_code(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    fn message(&self) -> &str {
        match self {
            Self::Api { message, .. } => message,
            Self::Transport(message) => message,
            Self::InvalidRequest(message) => message,
        }
    }

    fn error_code(&self) -> Option<&str> {
        match self {
            Self::Api { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

/// Errors raised while converting between state and remote payloads.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: &'static str, message: String },
}

impl CodecError {
    pub fn invalid_value(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            message: message.into(),
        }
    }
}
