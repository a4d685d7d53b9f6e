//! The ReplicaSet kind: keeps N identical pods alive.

use std::collections::BTreeMap;

use keel_id::Generation;
use serde::{Deserialize, Serialize};

use crate::condition::{self, Condition};
use crate::resource::impl_resource;
use crate::{LabelSelector, ObjectMeta, PodSpec};

/// Label carrying the hash of the template a pod was created from.
pub const LABEL_TEMPLATE_HASH: &str = "keel.io/template-hash";

/// Condition type: the controller could not create or delete pods.
pub const REPLICA_FAILURE: &str = "ReplicaFailure";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateMeta {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodTemplateSpec {
    #[serde(default)]
    pub metadata: TemplateMeta,
    pub spec: PodSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSetSpec {
    pub replicas: u32,
    pub selector: LabelSelector,
    pub template: PodTemplateSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSetStatus {
    #[serde(default)]
    pub replicas: u32,
    /// Pods currently running.
    #[serde(default)]
    pub ready_replicas: u32,
    /// Pods bound to a node.
    #[serde(default)]
    pub scheduled_replicas: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<Generation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicaSet {
    pub metadata: ObjectMeta,
    pub spec: ReplicaSetSpec,
    #[serde(default)]
    pub status: ReplicaSetStatus,
}

impl_resource!(ReplicaSet, "ReplicaSet");

impl ReplicaSet {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: ReplicaSetSpec) -> Self {
        Self {
            metadata: ObjectMeta::namespaced(namespace, name),
            spec,
            status: ReplicaSetStatus::default(),
        }
    }

    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        condition::find(&self.status.conditions, type_)
    }
}
