//! The Node kind: one execution host.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::condition::{self, Condition, ConditionStatus};
use crate::resource::impl_resource;
use crate::{ObjectMeta, ResourceList};

/// Label every node carries with its own name.
pub const LABEL_HOSTNAME: &str = "keel.io/hostname";

/// Condition type reported by the node agent heartbeat.
pub const NODE_READY: &str = "Ready";

/// Taint added by the node lifecycle controller when heartbeats stop.
pub const TAINT_NODE_UNREACHABLE: &str = "node.keel.io/unreachable";

/// Taint mirroring `spec.unschedulable`.
pub const TAINT_NODE_UNSCHEDULABLE: &str = "node.keel.io/unschedulable";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaintEffect {
    /// New pods are not placed unless they tolerate the taint.
    NoSchedule,
    /// Scoring penalty only.
    PreferNoSchedule,
    /// Like `NoSchedule`, and running pods without a toleration are evicted.
    NoExecute,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Taint {
    pub key: String,
    #[serde(default)]
    pub value: String,
    pub effect: TaintEffect,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_added: Option<DateTime<Utc>>,
}

impl Taint {
    pub fn new(key: impl Into<String>, effect: TaintEffect) -> Self {
        Self {
            key: key.into(),
            value: String::new(),
            effect,
            time_added: None,
        }
    }

    /// Whether the taint keeps new pods off the node.
    pub fn blocks_scheduling(&self) -> bool {
        matches!(self.effect, TaintEffect::NoSchedule | TaintEffect::NoExecute)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<Taint>,
    #[serde(default)]
    pub unschedulable: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    #[serde(default)]
    pub capacity: ResourceList,
    /// Capacity minus reserved overhead; what the scheduler fits against.
    #[serde(default)]
    pub allocatable: ResourceList,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: NodeSpec,
    #[serde(default)]
    pub status: NodeStatus,
}

impl_resource!(Node, "Node");

impl Node {
    /// A cluster-scoped node carrying its hostname label.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let mut metadata = ObjectMeta::cluster(name.clone());
        metadata.labels.insert(LABEL_HOSTNAME.to_string(), name);
        Self {
            metadata,
            ..Default::default()
        }
    }

    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        condition::find(&self.status.conditions, type_)
    }

    pub fn is_ready(&self) -> bool {
        self.condition(NODE_READY)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }

    pub fn taint(&self, key: &str) -> Option<&Taint> {
        self.spec.taints.iter().find(|t| t.key == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_node_has_hostname_label() {
        let node = Node::new("worker-1");
        assert_eq!(node.metadata.labels[LABEL_HOSTNAME], "worker-1");
        assert!(node.metadata.namespace.is_empty());
    }

    #[test]
    fn test_is_ready() {
        let mut node = Node::new("a");
        assert!(!node.is_ready());
        node.status
            .conditions
            .push(Condition::new(NODE_READY, ConditionStatus::True, "", ""));
        assert!(node.is_ready());
        node.status.conditions[0].status = ConditionStatus::Unknown;
        assert!(!node.is_ready());
    }

    #[test]
    fn test_blocks_scheduling() {
        assert!(Taint::new("a", TaintEffect::NoSchedule).blocks_scheduling());
        assert!(Taint::new("a", TaintEffect::NoExecute).blocks_scheduling());
        assert!(!Taint::new("a", TaintEffect::PreferNoSchedule).blocks_scheduling());
    }
}
