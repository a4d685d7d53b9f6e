//! The Lease kind: a time-bound lock record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::resource::impl_resource;
use crate::ObjectMeta;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseSpec {
    /// Identity of the current holder; `None` after a voluntary release.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder_identity: Option<String>,
    #[serde(default)]
    pub lease_duration_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acquire_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renew_time: Option<DateTime<Utc>>,
    /// Number of times the lease changed hands.
    #[serde(default)]
    pub lease_transitions: u32,
}

impl LeaseSpec {
    pub fn is_held_by(&self, identity: &str) -> bool {
        self.holder_identity.as_deref() == Some(identity)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub metadata: ObjectMeta,
    pub spec: LeaseSpec,
    #[serde(default)]
    pub status: (),
}

impl_resource!(Lease, "Lease");

impl Lease {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: LeaseSpec) -> Self {
        Self {
            metadata: ObjectMeta::namespaced(namespace, name),
            spec,
            status: (),
        }
    }
}
