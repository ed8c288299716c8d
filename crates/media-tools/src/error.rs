//! Error types for local media tools

/// Errors from local media inspection and processing.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("probe failed: {0}")]
    ProbeFailed(String),

    #[error("{program} failed (exit code {code:?}): {message}")]
    CommandFailed {
        program: String,
        code: Option<i32>,
        message: String,
    },
}

/// Result alias for media tool operations.
pub type Result<T> = std::result::Result<T, Error>;
