//! Common error types for services

use thiserror::Error;

/// Errors raised by the collaborators around the streaming core
/// (instrument catalog, downstream publishers).
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Connection failed error
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Authentication failed error
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Service unavailable error
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Invalid request error
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Internal error
    #[error("Internal error: {0}")]
    InternalError(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Rate limited error
    #[error("Rate limited: {0}")]
    RateLimited(String),
}

impl ServiceError {
    /// Whether the caller may retry the same request later
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_)
                | Self::ServiceUnavailable(_)
                | Self::Timeout(_)
                | Self::RateLimited(_)
        )
    }

    /// Map an HTTP status code returned by a provider endpoint
    #[must_use]
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            401 | 403 => Self::AuthenticationFailed(body),
            400 | 404 | 422 => Self::InvalidRequest(body),
            408 => Self::Timeout(body),
            429 => Self::RateLimited(body),
            500..=599 => Self::ServiceUnavailable(body),
            _ => Self::InternalError(format!("unexpected status {status}: {body}")),
        }
    }
}
