//! Store error types.

use keel_api::{ApiError, ObjectKey};
use keel_id::ResourceVersion;
use thiserror::Error;

/// Object store operation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Object deleted or never existed.
    #[error("{0} not found")]
    NotFound(ObjectKey),

    /// Create of a key that is already taken.
    #[error("{0} already exists")]
    AlreadyExists(ObjectKey),

    /// Optimistic concurrency failure; re-read and retry.
    #[error("conflict on {key}: {message}")]
    Conflict { key: ObjectKey, message: String },

    /// The requested version has been compacted away; relist.
    #[error("resource version {requested} is too old (oldest available {oldest})")]
    Gone {
        requested: ResourceVersion,
        oldest: ResourceVersion,
    },

    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The request was malformed.
    #[error("invalid request: {0}")]
    Invalid(String),

    /// An object could not be converted to or from its stored form.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_gone(&self) -> bool {
        matches!(self, Self::Gone { .. })
    }

    /// Errors worth retrying with backoff without re-reading.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    pub(crate) fn conflict(key: &ObjectKey, message: impl Into<String>) -> Self {
        Self::Conflict {
            key: key.clone(),
            message: message.into(),
        }
    }
}

impl From<ApiError> for StoreError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Invalid(msg) => Self::Invalid(msg),
            other => Self::Serialization(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;
