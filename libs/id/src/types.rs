//! Typed ID definitions and version counters.
//!
//! Typed IDs are ULID-based for sortability and uniqueness. Versions are
//! plain integers handed out by the object store.

use crate::define_id;
use crate::IdError;

// =============================================================================
// Object Identity
// =============================================================================

define_id!(ObjectUid, "uid");

// =============================================================================
// Coordination and Audit
// =============================================================================

define_id!(HolderId, "hld");
define_id!(RequestId, "req");

// =============================================================================
// Resource Version
// =============================================================================

/// Store-assigned version stamp used for optimistic concurrency.
///
/// Every successful write produces a strictly larger version than any
/// version previously handed out by the same store. `ZERO` is never assigned
/// to an object; it means "before anything happened" when used as a watch
/// starting point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceVersion(u64);

impl ResourceVersion {
    /// The version that precedes every stored object.
    pub const ZERO: Self = Self(0);

    /// Creates a new ResourceVersion from a u64.
    #[must_use]
    pub const fn new(version: u64) -> Self {
        Self(version)
    }

    /// Returns the underlying u64 value.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Returns the next version.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ResourceVersion {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        s.parse::<u64>()
            .map(Self)
            .map_err(|_| IdError::InvalidVersion(s.to_string()))
    }
}

impl From<u64> for ResourceVersion {
    fn from(version: u64) -> Self {
        Self(version)
    }
}

impl From<ResourceVersion> for u64 {
    fn from(version: ResourceVersion) -> Self {
        version.0
    }
}

impl serde::Serialize for ResourceVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for ResourceVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let version = u64::deserialize(deserializer)?;
        Ok(Self(version))
    }
}

// =============================================================================
// Generation
// =============================================================================

/// Spec generation of an object.
///
/// Incremented by the store only when the desired state (`spec`) changes,
/// so controllers can compare it with an `observedGeneration` to detect
/// stale status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(i64);

impl Generation {
    /// The generation of a freshly created object.
    pub const FIRST: Self = Self(1);

    /// Creates a new Generation from an i64.
    #[must_use]
    pub const fn new(generation: i64) -> Self {
        Self(generation)
    }

    /// Returns the underlying i64 value.
    #[must_use]
    pub const fn value(&self) -> i64 {
        self.0
    }

    /// Returns the next generation.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl Default for Generation {
    fn default() -> Self {
        Self::FIRST
    }
}

impl std::fmt::Display for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Generation {
    fn from(generation: i64) -> Self {
        Self(generation)
    }
}

impl serde::Serialize for Generation {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_i64(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for Generation {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let generation = i64::deserialize(deserializer)?;
        Ok(Self(generation))
    }
}

// =============================================================================
// Tests
// =============================================================================
