//! Error types for remote enhancement service calls

use std::time::Duration;

use crate::classify::is_credit_message;

/// Errors from the remote enhancement service.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("network error: {0}")]
    Network(String),

    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Message is kept verbatim ("Insufficient credits", "Credit refill in progress").
    #[error("{0}")]
    CreditExhausted(String),

    #[error("remote returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("unexpected response: {0}")]
    Protocol(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl Error {
    /// Whether retrying on another credential after a credit refresh can help.
    pub fn is_credit_exhaustion(&self) -> bool {
        match self {
            Error::CreditExhausted(_) => true,
            other => is_credit_message(&other.to_string()),
        }
    }

    /// Server-provided backoff for rate-limit errors.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Result alias for remote client operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credit_exhaustion_detected_from_variant_and_message() {
        assert!(Error::CreditExhausted("Insufficient credits".into()).is_credit_exhaustion());
        assert!(
            Error::Api {
                status: 400,
                message: "Credit refill in progress, try later".into()
            }
            .is_credit_exhaustion()
        );
        assert!(!Error::Network("connection reset".into()).is_credit_exhaustion());
    }

    #[test]
    fn retry_after_only_for_rate_limits() {
        let limited = Error::RateLimited {
            message: "slow down".into(),
            retry_after: Some(Duration::from_secs(30)),
        };
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(30)));
        assert_eq!(Error::Protocol("x".into()).retry_after(), None);
    }
}
