//! Reconciliation errors.

use keel_api::ApiError;
use keel_store::StoreError;
use thiserror::Error;

/// Errors returned by a reconciler. Every variant is requeued with backoff
/// unless the controller's retry budget is exhausted.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A store call failed after the client's own transient retries.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The object cannot be reconciled as written (e.g. malformed spec).
    #[error("invalid object: {0}")]
    Invalid(String),

    /// Any other failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ReconcileError {
    /// Returns true for optimistic concurrency failures, which resolve on
    /// the next pass after a re-read.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Store(err) if err.is_conflict())
    }
}

impl From<ApiError> for ReconcileError {
    fn from(err: ApiError) -> Self {
        Self::Invalid(err.to_string())
    }
}
