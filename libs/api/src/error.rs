//! Error types for object conversion and validation.

use thiserror::Error;

/// Errors raised while converting or validating objects.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// A dynamic object was converted into the wrong typed kind.
    #[error("kind mismatch: expected '{expected}', got '{actual}'")]
    KindMismatch {
        expected: &'static str,
        actual: String,
    },

    /// The object failed validation.
    #[error("invalid object: {0}")]
    Invalid(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Serialization(err.to_string())
    }
}
