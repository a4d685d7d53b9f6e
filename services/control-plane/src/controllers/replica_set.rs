//! ReplicaSet controller.
//!
//! Keeps `spec.replicas` live pods stamped from the template. Pods are
//! named `<set>-<template hash>-<index>` using the lowest free index, so a
//! pass that runs on a cache missing its own earlier creates asks for the
//! same names again and the store rejects the duplicates.

use std::cmp::Reverse;
use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_api::{
    remove_condition, set_condition, Condition, ConditionStatus, ObjectKey, ObjectMeta,
    OwnerReference, Pod, PodPhase, ReplicaSet, ReplicaSetStatus, Resource, LABEL_TEMPLATE_HASH,
    RECONCILE_FAILED, REPLICA_FAILURE,
};
use keel_reconcile::{
    select_for_drain, Action, DrainPriority, InformerStore, ReconcileError, Reconciler, SpecHash,
};
use keel_store::{Api, StoreError};
use tracing::{debug, info, instrument, warn};

pub struct ReplicaSetController {
    replica_sets: InformerStore<ReplicaSet>,
    pods: InformerStore<Pod>,
    rs_api: Api<ReplicaSet>,
    pod_api: Api<Pod>,
}

impl ReplicaSetController {
    pub fn new(
        replica_sets: InformerStore<ReplicaSet>,
        pods: InformerStore<Pod>,
        rs_api: Api<ReplicaSet>,
        pod_api: Api<Pod>,
    ) -> Self {
        Self {
            replica_sets,
            pods,
            rs_api,
            pod_api,
        }
    }

    /// Pods in the set's namespace whose controller reference is `rs`.
    fn owned_pods(&self, rs: &ReplicaSet) -> Vec<Arc<Pod>> {
        self.pods
            .list_matching(&rs.metadata.namespace, &rs.spec.selector)
            .into_iter()
            .filter(|pod| is_owned_by(pod, rs))
            .collect()
    }

    async fn create_pods(
        &self,
        rs: &ReplicaSet,
        hash: &SpecHash,
        owned: &[Arc<Pod>],
        count: usize,
    ) -> Result<(), ReconcileError> {
        let taken: BTreeSet<&str> = owned.iter().map(|p| p.metadata.name.as_str()).collect();
        let prefix = format!("{}-{}", rs.metadata.name, hash.short());
        let names = (0..)
            .map(|i| format!("{prefix}-{i}"))
            .filter(|name| !taken.contains(name.as_str()))
            .take(count);

        for name in names {
            let pod = pod_from_template(rs, hash, name)?;
            match self.pod_api.create(&pod).await {
                Ok(created) => info!(pod = %created.key(), "Created pod"),
                Err(StoreError::AlreadyExists(key)) => debug!(pod = %key, "Pod already exists"),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn delete_pods(&self, victims: &[Arc<Pod>]) -> Result<(), ReconcileError> {
        for pod in victims {
            match self.pod_api.delete_object(pod).await {
                Ok(_) => info!(pod = %pod.key(), "Deleted pod"),
                Err(e) if e.is_not_found() || e.is_conflict() => {
                    debug!(pod = %pod.key(), "Pod already gone")
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Publish replica counts. Reaching this point means the pass worked,
    /// so any earlier `ReplicaFailure` is cleared.
    async fn update_status(&self, rs: &ReplicaSet, active: &[Arc<Pod>]) -> Result<(), ReconcileError> {
        let mut status = ReplicaSetStatus {
            replicas: count(active, |_| true),
            ready_replicas: count(active, |p| p.status.phase == PodPhase::Running),
            scheduled_replicas: count(active, |p| p.is_bound()),
            observed_generation: Some(rs.metadata.generation),
            conditions: rs.status.conditions.clone(),
        };
        remove_condition(&mut status.conditions, REPLICA_FAILURE);
        if status == rs.status {
            return Ok(());
        }
        let mut next = rs.clone();
        next.status = status;
        self.rs_api.update_status(&next).await?;
        Ok(())
    }
}

#[async_trait]
impl Reconciler for ReplicaSetController {
    fn name(&self) -> &str {
        "replica-set"
    }

    #[instrument(skip_all, fields(replica_set = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let Some(rs) = self.replica_sets.get(key) else {
            return Ok(Action::await_change());
        };
        // Dependents of a deleting set belong to the garbage collector.
        if rs.metadata.is_deleting() {
            return Ok(Action::await_change());
        }

        let hash = SpecHash::of(&rs.spec.template)
            .map_err(|e| ReconcileError::Invalid(format!("unhashable template: {e}")))?;
        let owned = self.owned_pods(&rs);

        let finished: Vec<_> = owned
            .iter()
            .filter(|p| p.is_terminal() && !p.metadata.is_deleting())
            .cloned()
            .collect();
        self.delete_pods(&finished).await?;

        let active: Vec<_> = owned
            .iter()
            .filter(|p| !p.is_terminal() && !p.metadata.is_deleting())
            .cloned()
            .collect();
        let desired = rs.spec.replicas as usize;

        if active.len() < desired {
            let missing = desired - active.len();
            debug!(missing, "Scaling up");
            self.create_pods(&rs, &hash, &owned, missing).await?;
        } else if active.len() > desired {
            let surplus = active.len() - desired;
            debug!(surplus, "Scaling down");
            let victims = select_for_drain(active.clone(), surplus, drain_key);
            self.delete_pods(&victims).await?;
        }

        self.update_status(&rs, &active).await?;
        Ok(Action::await_change())
    }

    async fn on_poison(&self, key: &ObjectKey, error: &ReconcileError) -> Result<(), ReconcileError> {
        warn!(replica_set = %key, error = %error, "Giving up on replica set");
        let api = self.rs_api.within(&key.namespace);
        let Some(mut rs) = api.get_opt(&key.name).await? else {
            return Ok(());
        };
        if rs.metadata.is_deleting() {
            return Ok(());
        }
        let changed = set_condition(
            &mut rs.status.conditions,
            Condition::new(
                REPLICA_FAILURE,
                ConditionStatus::True,
                RECONCILE_FAILED,
                error.to_string(),
            ),
        );
        if changed {
            api.update_status(&rs).await?;
        }
        Ok(())
    }
}

/// Map a pod to the key of the set controlling it.
pub fn owner_key(pod: &Pod) -> Vec<ObjectKey> {
    pod.metadata
        .controller_ref()
        .filter(|r| r.kind == ReplicaSet::KIND)
        .map(|r| ObjectKey::new(ReplicaSet::KIND, pod.metadata.namespace.clone(), r.name.clone()))
        .into_iter()
        .collect()
}

fn is_owned_by(pod: &Pod, rs: &ReplicaSet) -> bool {
    pod.metadata
        .controller_ref()
        .is_some_and(|r| r.kind == ReplicaSet::KIND && Some(r.uid) == rs.metadata.uid)
}

/// Cheapest class first, then newest, then name so equal timestamps
/// still order the same way on every pass.
fn drain_key(pod: &Arc<Pod>) -> (DrainPriority, (Reverse<Option<DateTime<Utc>>>, String)) {
    (
        drain_priority(pod),
        (
            Reverse(pod.metadata.creation_timestamp),
            pod.metadata.name.clone(),
        ),
    )
}

fn drain_priority(pod: &Pod) -> DrainPriority {
    if pod.metadata.is_deleting() {
        DrainPriority::Terminating
    } else if pod.is_terminal() {
        DrainPriority::Terminal
    } else if !pod.is_bound() {
        DrainPriority::Unscheduled
    } else if pod.status.phase == PodPhase::Pending {
        DrainPriority::Pending
    } else {
        DrainPriority::Running
    }
}

fn count(pods: &[Arc<Pod>], pred: impl Fn(&Pod) -> bool) -> u32 {
    u32::try_from(pods.iter().filter(|p| pred(p)).count()).unwrap_or(u32::MAX)
}

fn pod_from_template(rs: &ReplicaSet, hash: &SpecHash, name: String) -> Result<Pod, ReconcileError> {
    let uid = rs
        .metadata
        .uid
        .ok_or_else(|| ReconcileError::Invalid(format!("{} has no uid", rs.key())))?;
    let template = &rs.spec.template;

    let mut metadata = ObjectMeta::namespaced(rs.metadata.namespace.clone(), name);
    metadata.labels = template.metadata.labels.clone();
    metadata
        .labels
        .insert(LABEL_TEMPLATE_HASH.to_string(), hash.short().to_string());
    metadata.annotations = template.metadata.annotations.clone();
    metadata.owner_references.push(OwnerReference {
        kind: ReplicaSet::KIND.to_string(),
        name: rs.metadata.name.clone(),
        uid,
        controller: true,
    });

    Ok(Pod {
        metadata,
        spec: template.spec.clone(),
        status: Default::default(),
    })
}
