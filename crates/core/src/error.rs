//! Coordination error model.

use thiserror::Error;

/// Result type used across the queue and lock layers.
pub type CoordinationResult<T> = Result<T, CoordinationError>;

/// Error taxonomy shared by the job queue and the lock manager.
///
/// Validation errors are caller mistakes and must never be retried automatically.
/// `Internal` wraps backing-store failures with the operation and resource that
/// were being worked on.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoordinationError {
    /// Input failed validation (e.g. unknown job type, empty worker id).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A job or lock does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The resource is already held by someone else.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A bounded wait elapsed before the resource became available.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The caller's ownership token no longer matches the stored one.
    #[error("ownership check failed: {0}")]
    Ownership(String),

    /// The caller cancelled a blocking operation.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// The backing store failed.
    #[error("{operation} failed for {resource}: {message}")]
    Internal {
        operation: String,
        resource: String,
        message: String,
    },
}

impl CoordinationError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn ownership(msg: impl Into<String>) -> Self {
        Self::Ownership(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn internal(
        operation: impl Into<String>,
        resource: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Internal {
            operation: operation.into(),
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Lock contention outcomes that a caller is expected to handle by waiting.
    pub fn is_contention(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::Timeout(_))
    }
}
