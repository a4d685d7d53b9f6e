//! Deterministic hashing of desired state.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Truncated SHA-256 of a value's JSON form.
///
/// Stamped on dependents so a template change is visible without diffing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecHash(String);

impl SpecHash {
    /// Hash a JSON document. `Value` objects keep their keys sorted, so the
    /// compact rendering is already canonical.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let digest = Sha256::digest(json.to_string().as_bytes());
        Self(hex::encode(&digest[..16]))
    }

    /// Hash any serializable value.
    pub fn of<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::from_json(&serde_json::to_value(value)?))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form suitable for a label value.
    pub fn short(&self) -> &str {
        self.0.get(..10).unwrap_or(&self.0)
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
