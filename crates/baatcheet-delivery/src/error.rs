//! Error types for webhook delivery operations.
//!
//! Every failed HTTP attempt is described by a [`DeliveryError`] and written
//! to the attempt log. The engine retries all of them on the same fixed
//! schedule; the [`ErrorCategory`] only feeds logging and audit.

use std::fmt;

use baatcheet_core::CoreError;
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Errors raised while delivering or dispatching webhooks.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Network-level connectivity failure.
    #[error("network connection failed: {message}")]
    NetworkError {
        /// Error message describing the network failure
        message: String,
    },

    /// HTTP request timeout exceeded.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Number of seconds before the request timed out
        timeout_seconds: u64,
    },

    /// HTTP response indicated client error (4xx).
    #[error("client error: HTTP {status_code}")]
    ClientError {
        /// HTTP status code (4xx)
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// HTTP response indicated server error (5xx).
    #[error("server error: HTTP {status_code}")]
    ServerError {
        /// HTTP status code (5xx)
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// Response outside the 2xx, 4xx, and 5xx ranges.
    #[error("unexpected response: HTTP {status_code}")]
    UnexpectedStatus {
        /// HTTP status code
        status_code: u16,
    },

    /// Target registration does not exist or belongs to another owner.
    #[error("webhook {webhook_id} not found")]
    WebhookNotFound {
        /// Requested registration
        webhook_id: String,
    },

    /// Durable store operation failed.
    #[error("database error: {message}")]
    DatabaseError {
        /// Database error message
        message: String,
    },

    /// Invalid client or engine configuration.
    #[error("invalid delivery configuration: {message}")]
    ConfigurationError {
        /// Configuration error message
        message: String,
    },

    /// Unexpected internal error.
    #[error("internal delivery error: {message}")]
    InternalError {
        /// Internal error message
        message: String,
    },
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates a client error from HTTP response.
    pub fn client_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ClientError { status_code, body: body.into() }
    }

    /// Creates a server error from HTTP response.
    pub fn server_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ServerError { status_code, body: body.into() }
    }

    /// Maps a non-2xx response to the matching variant.
    pub fn from_status(status_code: u16, body: impl Into<String>) -> Self {
        match status_code {
            400..=499 => Self::client_error(status_code, body),
            500..=599 => Self::server_error(status_code, body),
            _ => Self::UnexpectedStatus { status_code },
        }
    }

    /// Creates a not found error.
    pub fn webhook_not_found(webhook_id: impl fmt::Display) -> Self {
        Self::WebhookNotFound { webhook_id: webhook_id.to_string() }
    }

    /// Creates a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::DatabaseError { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError { message: message.into() }
    }

    /// HTTP status carried by the error, if a response arrived.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::ClientError { status_code, .. }
            | Self::ServerError { status_code, .. }
            | Self::UnexpectedStatus { status_code } => Some(*status_code),
            _ => None,
        }
    }

    /// Whether the failure counts against the retry budget of a delivery.
    ///
    /// Every HTTP-level outcome is retried on the fixed schedule, 4xx
    /// included. Store and configuration errors are not attempt failures.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NetworkError { .. }
                | Self::Timeout { .. }
                | Self::ClientError { .. }
                | Self::ServerError { .. }
                | Self::UnexpectedStatus { .. }
        )
    }

    /// Category for logging and the attempt log.
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::from(self)
    }
}

impl From<CoreError> for DeliveryError {
    fn from(error: CoreError) -> Self {
        match error {
            CoreError::NotFound(what) => Self::WebhookNotFound { webhook_id: what },
            other => Self::database(other.to_string()),
        }
    }
}

/// Category of delivery error for logging and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network connectivity issues and timeouts.
    Network,
    /// HTTP client errors (4xx).
    Client,
    /// HTTP server errors (5xx) and other unexpected statuses.
    Server,
    /// Database operations.
    Database,
    /// Configuration problems and missing registrations.
    Configuration,
    /// Internal system errors.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::NetworkError { .. } | DeliveryError::Timeout { .. } => Self::Network,
            DeliveryError::ClientError { .. } => Self::Client,
            DeliveryError::ServerError { .. } | DeliveryError::UnexpectedStatus { .. } => Self::Server,
            DeliveryError::DatabaseError { .. } => Self::Database,
            DeliveryError::WebhookNotFound { .. } | DeliveryError::ConfigurationError { .. } => {
                Self::Configuration
            },
            DeliveryError::InternalError { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Client => write!(f, "client"),
            Self::Server => write!(f, "server"),
            Self::Database => write!(f, "database"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}
