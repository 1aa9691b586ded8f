//! Error types for the REST adapter.

use azdo_reconcile_core::RemoteError;
use thiserror::Error;

/// Result type alias for REST adapter operations.
pub type Result<T> = std::result::Result<T, RestError>;

/// Errors that can occur while talking to the REST API.
#[derive(Debug, Error)]
pub enum RestError {
    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// API error response from the service
    #[error("API error ({status}): {message}")]
    Api {
        status: u16,
        code: Option<String>,
        message: String,
    },

    /// Invalid configuration or request data
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Missing or malformed credentials
    #[error("Authentication error: {0}")]
    Auth(String),
}

impl RestError {
    /// Create an API error from status, optional type key and message
    pub fn api(status: u16, code: Option<String>, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            code,
            message: message.into(),
        }
    }

    /// Create an invalid request error
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// Create an auth error
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    /// HTTP status if this is an API error.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<RestError> for RemoteError {
    fn from(err: RestError) -> Self {
        match err {
            RestError::Api {
                status,
                code: Some(code),
                message,
            } => RemoteError::api_with_code(status, code, message),
            RestError::Api {
                status,
                code: None,
                message,
            } => RemoteError::api(status, message),
            RestError::Http(err) => RemoteError::transport(err.to_string()),
            RestError::Json(err) => RemoteError::transport(format!("malformed response: {}", err)),
            RestError::InvalidRequest(message) | RestError::Auth(message) => {
                RemoteError::invalid_request(message)
            }
        }
    }
}
