//! Error types for the job subsystem.

use thiserror::Error;

/// A submission was rejected before reaching any queue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("field `{field}` {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("unknown job type `{0}`")]
    UnknownType(String),

    #[error("malformed payload: {0}")]
    Malformed(String),
}

impl ValidationError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ValidationError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Errors reported by a [`JobStore`](super::JobStore) implementation.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// A record with this id already exists. Enqueue treats this as success.
    #[error("job {0} already exists")]
    Conflict(String),

    /// The store could not be reached (connect failure, pool timeout, I/O).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Connection target rejected by transport policy.
    #[error("store configuration rejected: {0}")]
    Config(String),

    #[error("store query failed: {0}")]
    Query(String),

    #[error("failed to decode job record: {0}")]
    Decode(String),
}

impl StoreError {
    /// Whether the failure is about reaching the store rather than the request.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Config(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_) => StoreError::Unavailable(err.to_string()),
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::Decode(_)
            | sqlx::Error::ColumnNotFound(_) => StoreError::Decode(err.to_string()),
            _ => StoreError::Query(err.to_string()),
        }
    }
}

/// Top-level error for enqueue and queue resolution.
#[derive(Debug, Error)]
pub enum JobsError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("unknown queue `{0}`")]
    UnknownQueue(String),
}
