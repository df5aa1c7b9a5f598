//! Resilio error types

use std::time::Duration;

/// Resilio error types.
///
/// Normal negative outcomes (cache miss, rate-limit admission denied) are
/// plain return values in their components; they only become errors here
/// when a caller asks for `?`-friendly propagation.
#[derive(Debug, thiserror::Error)]
pub enum ResilioError {
    // Pool errors
    #[error("connection pool exhausted after waiting {waited:?}")]
    PoolExhausted { waited: Duration },

    #[error("connection pool is closed")]
    PoolClosed,

    #[error("failed to open connection: {0}")]
    Connect(String),

    // Admission errors
    #[error("rate limit exceeded for route '{route}', retry after {retry_after:?}")]
    Throttled { route: String, retry_after: Duration },

    // Dependency errors
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("dependency timed out: {0}")]
    Timeout(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("upstream rate limited, retry after {retry_after:?}")]
    UpstreamRateLimited { retry_after: Option<Duration> },

    /// Catch-all for dependency failures the caller knows to be retryable
    /// (connection reset, deadlock victim, serialization failure...).
    #[error("transient dependency error: {0}")]
    Transient(String),

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    // Data errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl ResilioError {
    /// Whether a retry could plausibly succeed.
    ///
    /// Transient: pool exhaustion, connection failures, network and timeout
    /// errors, upstream rate limiting, and API statuses 408, 429 and 5xx.
    /// `Throttled` is permanent: admission decisions are never retried.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::PoolExhausted { .. }
            | Self::Connect(_)
            | Self::Http(_)
            | Self::Timeout(_)
            | Self::UpstreamRateLimited { .. }
            | Self::Transient(_) => true,
            Self::Api { status, .. } => matches!(status, 408 | 429 | 500..=599),
            _ => false,
        }
    }

    /// Upstream back-off hint, if the dependency supplied one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::UpstreamRateLimited { retry_after } => *retry_after,
            Self::Throttled { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// HTTP status the outer web layer should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Throttled { .. } => 429,
            Self::PoolExhausted { .. } | Self::PoolClosed | Self::Connect(_) => 503,
            Self::Timeout(_) => 504,
            Self::Http(_) | Self::UpstreamRateLimited { .. } | Self::Transient(_) => 502,
            Self::Api { status, .. } if *status >= 500 => 502,
            Self::Api { status, .. } => *status,
            Self::AuthenticationFailed => 401,
            Self::InvalidInput(_) | Self::Json(_) => 400,
            Self::Configuration(_) => 500,
            Self::Cancelled => 499,
        }
    }
}

impl From<reqwest::Error> for ResilioError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ResilioError::Timeout(err.to_string())
        } else if let Some(status) = err.status() {
            ResilioError::Api {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            ResilioError::Http(err.to_string())
        }
    }
}

/// Result type alias for Resilio operations
pub type Result<T> = std::result::Result<T, ResilioError>;
