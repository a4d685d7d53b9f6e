//! # keel-api
//!
//! The object model shared by the store client, the controller runtime and
//! the scheduler.
//!
//! ## Design Principles
//!
//! - Every object carries the same [`ObjectMeta`]: identity, version stamp,
//!   generation, owner references, finalizers and deletion timestamp
//! - `spec` is desired state written by clients; `status` is observed state
//!   written by controllers
//! - Typed kinds implement [`Resource`]; the store itself only sees
//!   [`DynamicObject`]s, so any kind round-trips through one storage format
//!
//! ## Kinds
//!
//! - [`Pod`]: the schedulable workload unit
//! - [`Node`]: an execution host with capacity, conditions and taints
//! - [`Lease`]: a time-bound lock record used for leader election
//! - [`ReplicaSet`]: keeps a number of pods from one template alive

mod condition;
mod error;
mod lease;
mod meta;
mod node;
mod pod;
mod quantity;
mod replica_set;
mod resource;
mod selector;

pub use condition::{
    remove_condition, set_condition, Condition, ConditionStatus, RECONCILE_FAILED,
};
pub use error::ApiError;
pub use lease::{Lease, LeaseSpec};
pub use meta::{
    validate_name, ObjectKey, ObjectMeta, OwnerReference, FOREGROUND_DELETION_FINALIZER,
};
pub use node::{
    Node, NodeSpec, NodeStatus, Taint, TaintEffect, LABEL_HOSTNAME, NODE_READY,
    TAINT_NODE_UNREACHABLE, TAINT_NODE_UNSCHEDULABLE,
};
pub use pod::{
    Affinity, Container, ContainerPort, NodeAffinity, NodeSelectorTerm, Pod, PodAffinity,
    PodAffinityTerm, PodPhase, PodSpec, PodStatus, PreferredSchedulingTerm, Protocol, Toleration,
    TolerationOperator, WeightedPodAffinityTerm, POD_SCHEDULED,
};
pub use quantity::{ResourceList, ResourceName};
pub use replica_set::{
    PodTemplateSpec, ReplicaSet, ReplicaSetSpec, ReplicaSetStatus, TemplateMeta,
    LABEL_TEMPLATE_HASH, REPLICA_FAILURE,
};
pub use resource::{DynamicObject, Resource};
pub use selector::{LabelSelector, LabelSelectorRequirement, SelectorOperator};

/// Re-export the id crate so dependents can name uids and versions
/// without a separate dependency.
pub use keel_id as id;
