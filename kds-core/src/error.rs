use thiserror::Error;

/// Failure reported by the storage backend.
///
/// The categories mirror the status codes a remote datastore service
/// reports; the client core never inspects them beyond `is_retryable`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Request timeout: {0}")]
    Timeout(String),

    #[error("Transaction aborted: {0}")]
    Aborted(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Unimplemented: {0}")]
    Unimplemented(String),

    #[error("Internal backend error: {0}")]
    Internal(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl BackendError {
    /// Returns true for transient failures a caller may re-issue.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BackendError::Unavailable(_)
                | BackendError::Timeout(_)
                | BackendError::Aborted(_)
                | BackendError::ResourceExhausted(_)
        )
    }
}

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed key or query arguments.
    #[error("Construction error: {0}")]
    Construction(String),

    /// Batch or transaction operation invoked outside its valid state.
    #[error("Invalid state: {0}")]
    State(String),

    #[error("Project mismatch: expected {expected:?}, found {found:?}")]
    ProjectMismatch { expected: String, found: String },

    /// Operation requires a complete key, or a complete key was given
    /// where a partial one is required.
    #[error("Partial key error: {0}")]
    PartialKey(String),

    /// Iterator restarted or double-started.
    #[error("Usage error: {0}")]
    Usage(String),

    #[error("Batch stack underflow")]
    Underflow,

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

impl Error {
    /// Returns a stable error code for this error variant.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Construction(_) => "CONSTRUCTION_ERROR",
            Error::State(_) => "STATE_ERROR",
            Error::ProjectMismatch { .. } => "PROJECT_MISMATCH",
            Error::PartialKey(_) => "PARTIAL_KEY",
            Error::Usage(_) => "USAGE_ERROR",
            Error::Underflow => "UNDERFLOW",
            Error::Backend(_) => "BACKEND_ERROR",
        }
    }

    /// Returns true if this error is potentially retryable.
    ///
    /// Programmer errors are never retryable. Backend failures are retryable
    /// when transient, but the core never retries on its own: callers must
    /// re-issue a fresh batch or transaction.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Backend(e) => e.is_retryable(),
            Error::Construction(_)
            | Error::State(_)
            | Error::ProjectMismatch { .. }
            | Error::PartialKey(_)
            | Error::Usage(_)
            | Error::Underflow => false,
        }
    }

    pub(crate) fn construction(msg: impl Into<String>) -> Self {
        Error::Construction(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
