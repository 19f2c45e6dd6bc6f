//! Error types for dispatch operations.
//!
//! Covers transport failures while sending to a chat, storage failures while
//! reading or writing mailing state, and rate-gate store failures. Errors
//! carry a category for log fields and a retry classification.

use std::{fmt, time::Duration};

use herald_core::CoreError;
use thiserror::Error;

/// Result type alias for dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Errors raised while claiming and dispatching mailings.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// Network-level connectivity failure.
    #[error("network connection failed: {message}")]
    Network {
        /// Error message describing the network failure
        message: String,
    },

    /// Transport request timed out.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Number of seconds before the request timed out
        timeout_seconds: u64,
    },

    /// Bot API answered with an error.
    #[error("api error {code}: {description}")]
    Api {
        /// HTTP or API error code
        code: u16,
        /// Description returned by the API
        description: String,
    },

    /// Bot API asked us to slow down.
    #[error("rate limited: retry after {retry_after_seconds}s")]
    RateLimited {
        /// Seconds to wait before retrying
        retry_after_seconds: u64,
    },

    /// Mailing store operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Storage error message
        message: String,
    },

    /// Shared rate-gate store failed.
    #[error("rate gate error: {message}")]
    RateGate {
        /// Rate store error message
        message: String,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {message}")]
    Configuration {
        /// Configuration error message
        message: String,
    },

    /// Unexpected internal error.
    #[error("internal dispatch error: {message}")]
    Internal {
        /// Internal error message
        message: String,
    },
}

impl DispatchError {
    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout: Duration) -> Self {
        Self::Timeout { timeout_seconds: timeout.as_secs() }
    }

    /// Creates an API error.
    pub fn api(code: u16, description: impl Into<String>) -> Self {
        Self::Api { code, description: description.into() }
    }

    /// Creates a rate limit error with retry guidance.
    pub fn rate_limited(retry_after_seconds: u64) -> Self {
        Self::RateLimited { retry_after_seconds }
    }

    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage { message: message.into() }
    }

    /// Creates a rate gate error.
    pub fn rate_gate(message: impl Into<String>) -> Self {
        Self::RateGate { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Whether a later attempt may succeed.
    ///
    /// Every transport failure is retryable from the engine's point of view:
    /// the recipient stays `FAILED` and is picked up by the next sweep.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. }
            | Self::Timeout { .. }
            | Self::Api { .. }
            | Self::RateLimited { .. }
            | Self::Storage { .. }
            | Self::RateGate { .. } => true,

            Self::Configuration { .. } | Self::Internal { .. } => false,
        }
    }

    /// Suggested delay for rate-limited errors.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after_seconds } => {
                Some(Duration::from_secs(*retry_after_seconds))
            },
            _ => None,
        }
    }
}

impl From<CoreError> for DispatchError {
    fn from(error: CoreError) -> Self {
        Self::storage(error.to_string())
    }
}

impl From<redis::RedisError> for DispatchError {
    fn from(error: redis::RedisError) -> Self {
        Self::rate_gate(error.to_string())
    }
}

/// Category of dispatch error for log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network connectivity issues.
    Network,
    /// Bot API rejected the request.
    Api,
    /// Rate limiting by the Bot API.
    RateLimit,
    /// Mailing store operations.
    Storage,
    /// Shared rate-gate store.
    RateGate,
    /// Configuration problems.
    Configuration,
    /// Internal system errors.
    Internal,
}

impl From<&DispatchError> for ErrorCategory {
    fn from(error: &DispatchError) -> Self {
        match error {
            DispatchError::Network { .. } | DispatchError::Timeout { .. } => Self::Network,
            DispatchError::Api { .. } => Self::Api,
            DispatchError::RateLimited { .. } => Self::RateLimit,
            DispatchError::Storage { .. } => Self::Storage,
            DispatchError::RateGate { .. } => Self::RateGate,
            DispatchError::Configuration { .. } => Self::Configuration,
            DispatchError::Internal { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Api => write!(f, "api"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::Storage => write!(f, "storage"),
            Self::RateGate => write!(f, "rate_gate"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}
