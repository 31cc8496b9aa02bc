//! Error types for key pool operations.
//!
//! Running out of keys on the plain acquire path is not an error: `acquire`
//! and `select_provider` return `None`. These types cover the call-wrapping
//! path and the persistence adapter.

use std::fmt;

use baatcheet_core::{CoreError, Provider};
use thiserror::Error;

/// Result type alias for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

/// Failure reported by an upstream provider call.
///
/// Built by the caller's closure in [`KeyPool::call_with_rotation`] so the
/// pool can decide whether the failure belongs to the key or to the request.
///
/// [`KeyPool::call_with_rotation`]: crate::KeyPool::call_with_rotation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamError {
    /// HTTP status returned by the provider, if a response arrived.
    pub status: Option<u16>,
    /// Provider error message.
    pub message: String,
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "HTTP {status}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for UpstreamError {}

impl UpstreamError {
    /// Creates an error from an HTTP response.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self { status: Some(status), message: message.into() }
    }

    /// Creates an error for a failure without a response.
    pub fn transport(message: impl Into<String>) -> Self {
        Self { status: None, message: message.into() }
    }

    /// Provider throttled this key.
    pub fn is_rate_limited(&self) -> bool {
        self.status == Some(429)
    }

    /// Failure tied to the credential rather than the request, so another
    /// key may succeed.
    pub fn is_key_specific(&self) -> bool {
        matches!(self.status, Some(401 | 403 | 429))
    }
}

/// Errors from key pool operations.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No usable key remains for the provider.
    #[error("no usable key for provider {provider}")]
    Exhausted {
        /// Provider whose keys are exhausted.
        provider: Provider,
    },

    /// The upstream call failed after the pool did what it could.
    #[error("upstream {provider} call failed: {source}")]
    Upstream {
        /// Provider that was called.
        provider: Provider,
        /// Last failure observed.
        #[source]
        source: UpstreamError,
    },

    /// Usage persistence failed.
    #[error("usage store error: {0}")]
    Storage(#[from] CoreError),

    /// Invalid pool configuration.
    #[error("invalid pool configuration: {message}")]
    Configuration {
        /// Description of the problem.
        message: String,
    },
}

impl PoolError {
    /// Creates an exhausted error.
    pub fn exhausted(provider: Provider) -> Self {
        Self::Exhausted { provider }
    }

    /// Creates an upstream failure error.
    pub fn upstream(provider: Provider, source: UpstreamError) -> Self {
        Self::Upstream { provider, source }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }
}
