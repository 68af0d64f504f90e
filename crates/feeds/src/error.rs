//! Error types for market data lookups.

use thiserror::Error;

/// Errors that can occur while fetching market data.
#[derive(Debug, Error)]
pub enum FeedError {
    /// The provider answered but has no data for this symbol/period.
    #[error("Data unavailable: {0}")]
    Unavailable(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Provider returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Failed to parse response: {0}")]
    ParseError(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Timeout: {0}")]
    Timeout(String),
}

impl From<reqwest::Error> for FeedError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FeedError::Timeout(err.to_string())
        } else if err.is_decode() {
            FeedError::ParseError(err.to_string())
        } else {
            FeedError::ConnectionFailed(err.to_string())
        }
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(err: serde_json::Error) -> Self {
        FeedError::ParseError(err.to_string())
    }
}

impl FeedError {
    /// True when the provider simply has nothing for the request.
    /// Rules depending on it are skipped, not failed.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, FeedError::Unavailable(_))
    }

    /// True when the provider itself could not be reached.
    pub fn is_unreachable(&self) -> bool {
        match self {
            FeedError::ConnectionFailed(_) | FeedError::Timeout(_) => true,
            FeedError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Returns true if this error is transient and likely to succeed on retry.
    pub fn is_transient(&self) -> bool {
        self.is_unreachable() || matches!(self, FeedError::RateLimitExceeded)
    }
}

/// Result type for feed operations.
pub type FeedResult<T> = Result<T, FeedError>;
