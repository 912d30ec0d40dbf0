//! Error taxonomy shared by every call path (fetch, create, delete, webhook, publish).
//!
//! Classification is a pure function of the error value: callers never inspect
//! messages to decide whether to retry, they ask [`SyncError::kind`].

use thiserror::Error;

/// Closed set of failure buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Network hiccup, timeout, unknown upstream failure.
    Transient,
    InvalidArgument,
    FailedPrecondition,
    PermissionDenied,
    Unauthenticated,
    /// The provider does not support this operation.
    Unimplemented,
    Storage,
    NotFound,
    Cancelled,
}

impl ErrorKind {
    /// Whether the surrounding retry mechanism should re-invoke the step.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Transient)
    }

    /// Stable machine-readable reason code surfaced to operators.
    pub fn reason(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "TRANSIENT",
            ErrorKind::InvalidArgument => "INVALID_ARGUMENT",
            ErrorKind::FailedPrecondition => "FAILED_PRECONDITION",
            ErrorKind::PermissionDenied => "PERMISSION_DENIED",
            ErrorKind::Unauthenticated => "UNAUTHENTICATED",
            ErrorKind::Unimplemented => "UNIMPLEMENTED",
            ErrorKind::Storage => "STORAGE_ERROR",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.reason())
    }
}

/// Every fallible operation in PaySync returns this error.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("transient error: {0}")]
    Transient(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("not implemented: {0}")]
    Unimplemented(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Transient(_) => ErrorKind::Transient,
            SyncError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            SyncError::FailedPrecondition(_) => ErrorKind::FailedPrecondition,
            SyncError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            SyncError::Unauthenticated(_) => ErrorKind::Unauthenticated,
            SyncError::Unimplemented(_) => ErrorKind::Unimplemented,
            SyncError::Storage(_) => ErrorKind::Storage,
            SyncError::NotFound(_) => ErrorKind::NotFound,
            SyncError::Cancelled(_) => ErrorKind::Cancelled,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Shorthand for [`ErrorKind::reason`].
    pub fn reason(&self) -> &'static str {
        self.kind().reason()
    }

    /// Prefix the message with call-site context without changing the kind.
    pub fn context(self, ctx: &str) -> Self {
        match self {
            SyncError::Transient(m) => SyncError::Transient(format!("{ctx}: {m}")),
            SyncError::InvalidArgument(m) => SyncError::InvalidArgument(format!("{ctx}: {m}")),
            SyncError::FailedPrecondition(m) => {
                SyncError::FailedPrecondition(format!("{ctx}: {m}"))
            }
            SyncError::PermissionDenied(m) => SyncError::PermissionDenied(format!("{ctx}: {m}")),
            SyncError::Unauthenticated(m) => SyncError::Unauthenticated(format!("{ctx}: {m}")),
            SyncError::Unimplemented(m) => SyncError::Unimplemented(format!("{ctx}: {m}")),
            SyncError::Storage(m) => SyncError::Storage(format!("{ctx}: {m}")),
            SyncError::NotFound(m) => SyncError::NotFound(format!("{ctx}: {m}")),
            SyncError::Cancelled(m) => SyncError::Cancelled(format!("{ctx}: {m}")),
        }
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::QueryReturnedNoRows => SyncError::NotFound(e.to_string()),
            other => SyncError::Storage(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        use serde_json::error::Category;
        match e.classify() {
            // Truncated body or a failed read: the next attempt may get it whole.
            Category::Eof | Category::Io => SyncError::Transient(format!("json: {e}")),
            Category::Syntax | Category::Data => SyncError::InvalidArgument(format!("json: {e}")),
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => SyncError::NotFound(e.to_string()),
            std::io::ErrorKind::PermissionDenied => SyncError::PermissionDenied(e.to_string()),
            _ => SyncError::Transient(e.to_string()),
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_builder() {
            return SyncError::InvalidArgument(e.to_string());
        }
        match e.status().map(|s| s.as_u16()) {
            Some(401) => SyncError::Unauthenticated(e.to_string()),
            Some(403) => SyncError::PermissionDenied(e.to_string()),
            Some(s) if (400..500).contains(&s) && s != 408 && s != 429 => {
                SyncError::InvalidArgument(e.to_string())
            }
            _ => SyncError::Transient(e.to_string()),
        }
    }
}

impl From<tokio::time::error::Elapsed> for SyncError {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        SyncError::Transient(format!("call timed out: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
