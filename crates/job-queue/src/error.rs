//! Error types for job processing and operator control

use std::time::Duration;

/// Errors from job processing and scheduler control.
///
/// Remote failures keep the client's error as-is so terminal job messages
/// carry the service's wording.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad operator input. Nothing was changed.
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Remote(#[from] enhance_client::Error),

    #[error("processing timeout after {checks} status checks ({waited_secs}s)")]
    ProcessingTimeout { checks: u32, waited_secs: u64 },

    #[error("processing failed on remote servers: {0}")]
    RemoteProcessingFailed(String),

    #[error("local I/O error: {0}")]
    LocalIo(String),

    #[error("no usable API key: {0}")]
    NoCredentials(String),

    #[error("job not found: {0}")]
    NotFound(String),

    /// Cooperative cancellation, not a failure of the job itself.
    #[error("stopped by user")]
    StoppedByUser,
}

/// How a failed attempt is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Refresh balances, rotate to another key after a short delay.
    Credit,
    /// Back the key off, then rotate.
    RateLimited(Option<Duration>),
    Generic,
}

impl FailureClass {
    pub fn label(&self) -> &'static str {
        match self {
            FailureClass::Credit => "credit",
            FailureClass::RateLimited(_) => "rate_limited",
            FailureClass::Generic => "generic",
        }
    }
}

impl Error {
    pub fn class(&self) -> FailureClass {
        match self {
            Error::Remote(e) if e.is_credit_exhaustion() => FailureClass::Credit,
            Error::Remote(enhance_client::Error::RateLimited { retry_after, .. }) => {
                FailureClass::RateLimited(*retry_after)
            }
            Error::NoCredentials(_) => FailureClass::Credit,
            other if enhance_client::is_credit_message(&other.to_string()) => FailureClass::Credit,
            _ => FailureClass::Generic,
        }
    }
}

/// Result alias for job-queue operations.
pub type Result<T> = std::result::Result<T, Error>;
