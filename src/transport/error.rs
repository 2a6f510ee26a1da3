//! Transport error types

use std::time::Duration;
use thiserror::Error;

/// Transport error with classification
#[derive(Debug, Error)]
#[error("{message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
    /// Numeric code reported by the remote service, if any
    pub error_code: Option<i64>,
    pub retry_after: Option<Duration>,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            error_code: None,
            retry_after: None,
        }
    }

    #[must_use]
    pub fn with_retry_after(mut self, duration: Duration) -> Self {
        self.retry_after = Some(duration);
        self
    }

    #[must_use]
    pub fn with_error_code(mut self, code: i64) -> Self {
        self.error_code = Some(code);
        self
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message)
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::RateLimit, message)
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::ServerError, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Auth, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::InvalidRequest, message)
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Decode, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Rejected, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Unknown, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        Self::decode(format!("Failed to decode payload: {e}"))
    }
}

/// Error classification for retry logic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Connection failures - retryable
    Network,
    /// Request exceeded its deadline - retryable
    Timeout,
    /// Flood control (429) - retryable after `retry_after`
    RateLimit,
    /// Server error (5xx) - retryable
    ServerError,
    /// Bad or revoked token (401, 403) - not retryable
    Auth,
    /// Bad request (400, 404) - not retryable
    InvalidRequest,
    /// Response body did not match the expected shape
    Decode,
    /// Remote answered `ok: false` without a more specific status
    Rejected,
    Unknown,
}

impl TransportErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Network | Self::Timeout | Self::RateLimit | Self::ServerError
        )
    }

    /// Classify an HTTP status code
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => Self::Auth,
            429 => Self::RateLimit,
            400 | 404 | 409 => Self::InvalidRequest,
            500..=599 => Self::ServerError,
            _ => Self::Unknown,
        }
    }
}
