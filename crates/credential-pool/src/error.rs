//! Error types for credential pool operations

/// Errors from credential pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The service rejected the key during validation.
    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    /// Validation could not be attempted.
    #[error("network error: {0}")]
    Network(String),

    #[error("credential already in pool: {0}")]
    Duplicate(String),

    #[error("credential not found: {0}")]
    NotFound(String),

    #[error("key store error: {0}")]
    Store(String),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
