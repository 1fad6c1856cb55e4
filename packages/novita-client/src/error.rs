//! Error taxonomy for the Novita API client.

use thiserror::Error;

/// Result type for Novita client operations.
pub type Result<T> = std::result::Result<T, NovitaError>;

/// Errors surfaced by the Novita API client.
///
/// Transport-level failures (timeouts, connection resets, 5xx, 429) are
/// retryable; request-level failures (400, 401/403, 404, validation) are not.
#[derive(Debug, Clone, Error)]
pub enum NovitaError {
    /// Request was rate limited (HTTP 429). Carries the server's retry hint
    /// when a `Retry-After` header was present.
    #[error("Rate limited{}", .retry_after_ms.map(|ms| format!(" (retry after {}ms)", ms)).unwrap_or_default())]
    RateLimited { retry_after_ms: Option<u64> },

    /// The client-side circuit breaker is open; no request was made.
    #[error("Circuit breaker open")]
    CircuitOpen,

    /// Request timed out.
    #[error("Request timeout: {0}")]
    Timeout(String),

    /// Connection-level failure (DNS, reset, refused).
    #[error("Network error: {0}")]
    Network(String),

    /// Resource does not exist (HTTP 404).
    #[error("Not found: {0}")]
    NotFound(String),

    /// The request was rejected as invalid (HTTP 400).
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Authentication or authorization failure (HTTP 401/403).
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Server-side failure (HTTP 5xx).
    #[error("Server error ({status}): {message}")]
    ServerError { status: u16, message: String },

    /// Anything that does not fit the taxonomy above.
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl NovitaError {
    /// Whether the caller may retry the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NovitaError::RateLimited { .. }
                | NovitaError::CircuitOpen
                | NovitaError::Timeout(_)
                | NovitaError::Network(_)
                | NovitaError::ServerError { .. }
        )
    }

    /// Classify an HTTP status + body into the taxonomy.
    pub fn from_status(status: u16, message: String, retry_after_ms: Option<u64>) -> Self {
        match status {
            400 => NovitaError::BadRequest(message),
            401 | 403 => NovitaError::Unauthorized(message),
            404 => NovitaError::NotFound(message),
            429 => NovitaError::RateLimited { retry_after_ms },
            500..=599 => NovitaError::ServerError { status, message },
            _ => NovitaError::Unknown(format!("HTTP {}: {}", status, message)),
        }
    }
}

impl From<reqwest::Error> for NovitaError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            NovitaError::Timeout(err.to_string())
        } else if err.is_connect() || err.is_request() {
            NovitaError::Network(err.to_string())
        } else if err.is_decode() {
            NovitaError::Unknown(format!("response decode failed: {}", err))
        } else {
            NovitaError::Unknown(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(NovitaError::Timeout("t".into()).is_retryable());
        assert!(NovitaError::Network("n".into()).is_retryable());
        assert!(NovitaError::CircuitOpen.is_retryable());
        assert!(NovitaError::RateLimited {
            retry_after_ms: Some(500)
        }
        .is_retryable());
        assert!(NovitaError::ServerError {
            status: 503,
            message: "unavailable".into()
        }
        .is_retryable());

        assert!(!NovitaError::BadRequest("b".into()).is_retryable());
        assert!(!NovitaError::NotFound("n".into()).is_retryable());
        assert!(!NovitaError::Unauthorized("u".into()).is_retryable());
        assert!(!NovitaError::Unknown("u".into()).is_retryable());
    }

    #[test]
    fn test_from_status() {
        assert!(matches!(
            NovitaError::from_status(400, "invalid state change".into(), None),
            NovitaError::BadRequest(_)
        ));
        assert!(matches!(
            NovitaError::from_status(404, "gone".into(), None),
            NovitaError::NotFound(_)
        ));
        assert!(matches!(
            NovitaError::from_status(429, "slow down".into(), Some(1000)),
            NovitaError::RateLimited {
                retry_after_ms: Some(1000)
            }
        ));
        assert!(matches!(
            NovitaError::from_status(502, "bad gateway".into(), None),
            NovitaError::ServerError { status: 502, .. }
        ));
    }
}
