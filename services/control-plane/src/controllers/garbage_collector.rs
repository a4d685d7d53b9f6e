//! Garbage collector for pods owned by replica sets.
//!
//! Two duties, both keyed by object:
//! - a pod whose controlling owner no longer exists (matched by uid, so a
//!   recreated namesake does not adopt it) is deleted;
//! - a replica set being deleted with the foreground finalizer has its
//!   pods deleted first, and the finalizer is removed once none remain.
//!
//! Owner absence is confirmed with a live read before anything is deleted;
//! the cache alone may simply be behind.

use std::sync::Arc;

use async_trait::async_trait;
use keel_api::{
    set_condition, Condition, ConditionStatus, ObjectKey, Pod, ReplicaSet, Resource,
    FOREGROUND_DELETION_FINALIZER, RECONCILE_FAILED,
};
use keel_reconcile::{Action, EventHandler, InformerStore, ReconcileError, Reconciler, WorkQueue};
use keel_store::Api;
use tracing::{debug, info, instrument, warn};

const REASON_COLLECTION_FAILED: &str = "GarbageCollectionFailed";

pub struct GarbageCollector {
    pods: InformerStore<Pod>,
    replica_sets: InformerStore<ReplicaSet>,
    pod_api: Api<Pod>,
    rs_api: Api<ReplicaSet>,
}

impl GarbageCollector {
    pub fn new(
        pods: InformerStore<Pod>,
        replica_sets: InformerStore<ReplicaSet>,
        pod_api: Api<Pod>,
        rs_api: Api<ReplicaSet>,
    ) -> Self {
        Self {
            pods,
            replica_sets,
            pod_api,
            rs_api,
        }
    }

    async fn collect_pod(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let Some(pod) = self.pods.get(key) else {
            return Ok(Action::await_change());
        };
        let Some(owner) = pod.metadata.controller_ref().cloned() else {
            return Ok(Action::await_change());
        };
        if owner.kind != ReplicaSet::KIND || pod.metadata.is_deleting() {
            return Ok(Action::await_change());
        }

        let cached = self
            .replica_sets
            .get_by_name(&pod.metadata.namespace, &owner.name)
            .filter(|rs| rs.metadata.uid == Some(owner.uid));
        let owner_obj = match cached {
            Some(rs) => Some(rs),
            None => self
                .rs_api
                .within(&pod.metadata.namespace)
                .get_opt(&owner.name)
                .await?
                .filter(|rs| rs.metadata.uid == Some(owner.uid))
                .map(Arc::new),
        };

        let orphaned = owner_obj.is_none();
        let cascading = owner_obj.as_deref().is_some_and(deleting_in_foreground);
        if !orphaned && !cascading {
            return Ok(Action::await_change());
        }

        match self.pod_api.delete_object(&pod).await {
            Ok(_) => info!(pod = %key, owner = %owner.name, orphaned, "Collected dependent"),
            Err(e) if e.is_not_found() || e.is_conflict() => debug!(pod = %key, "Dependent already gone"),
            Err(e) => return Err(e.into()),
        }
        Ok(Action::await_change())
    }

    async fn finalize_owner(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let Some(rs) = self.replica_sets.get(key) else {
            return Ok(Action::await_change());
        };
        if !deleting_in_foreground(&rs) {
            return Ok(Action::await_change());
        }

        // The pod cache may lag behind deletes issued a moment ago.
        let api = self.pod_api.within(&rs.metadata.namespace);
        let dependents: Vec<Pod> = api
            .list(None)
            .await?
            .items
            .into_iter()
            .filter(|p| is_dependent(p, &rs))
            .collect();

        if !dependents.is_empty() {
            for pod in dependents.iter().filter(|p| !p.metadata.is_deleting()) {
                match self.pod_api.delete_object(pod).await {
                    Ok(_) => info!(pod = %pod.key(), owner = %key, "Deleted dependent"),
                    Err(e) if e.is_not_found() || e.is_conflict() => {}
                    Err(e) => return Err(e.into()),
                }
            }
            debug!(owner = %key, remaining = dependents.len(), "Waiting for dependents");
            return Ok(Action::await_change());
        }

        let mut next = rs.as_ref().clone();
        next.metadata.remove_finalizer(FOREGROUND_DELETION_FINALIZER);
        match self.rs_api.update(&next).await {
            Ok(_) => info!(owner = %key, "Dependents gone; released owner"),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        Ok(Action::await_change())
    }
}

#[async_trait]
impl Reconciler for GarbageCollector {
    fn name(&self) -> &str {
        "garbage-collector"
    }

    #[instrument(skip_all, fields(object = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        match key.kind.as_str() {
            Pod::KIND => self.collect_pod(key).await,
            ReplicaSet::KIND => self.finalize_owner(key).await,
            other => Err(ReconcileError::Invalid(format!("unexpected kind {other}"))),
        }
    }

    /// Mark the dependent or owner that could not be cleaned up.
    async fn on_poison(&self, key: &ObjectKey, error: &ReconcileError) -> Result<(), ReconcileError> {
        warn!(object = %key, error = %error, "Giving up on collection");
        let failed = || {
            Condition::new(
                RECONCILE_FAILED,
                ConditionStatus::True,
                REASON_COLLECTION_FAILED,
                error.to_string(),
            )
        };
        match key.kind.as_str() {
            Pod::KIND => {
                let api = self.pod_api.within(&key.namespace);
                if let Some(mut pod) = api.get_opt(&key.name).await? {
                    if set_condition(&mut pod.status.conditions, failed()) {
                        api.update_status(&pod).await?;
                    }
                }
            }
            ReplicaSet::KIND => {
                let api = self.rs_api.within(&key.namespace);
                if let Some(mut rs) = api.get_opt(&key.name).await? {
                    if set_condition(&mut rs.status.conditions, failed()) {
                        api.update_status(&rs).await?;
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

fn deleting_in_foreground(rs: &ReplicaSet) -> bool {
    rs.metadata.is_deleting() && rs.metadata.has_finalizer(FOREGROUND_DELETION_FINALIZER)
}

fn is_dependent(pod: &Pod, rs: &ReplicaSet) -> bool {
    pod.metadata
        .owner_references
        .iter()
        .any(|r| r.kind == ReplicaSet::KIND && Some(r.uid) == rs.metadata.uid)
}

/// Enqueues pods on their own changes and, on any owner change, the owner
/// plus every cached dependent.
pub struct GcHandler {
    queue: WorkQueue<ObjectKey>,
    pods: InformerStore<Pod>,
}

impl GcHandler {
    pub fn new(queue: WorkQueue<ObjectKey>, pods: InformerStore<Pod>) -> Arc<Self> {
        Arc::new(Self { queue, pods })
    }

    fn enqueue_owner(&self, rs: &ReplicaSet) {
        self.queue.add(rs.key());
        for pod in self.pods.list() {
            if pod.metadata.namespace == rs.metadata.namespace && is_dependent(&pod, rs) {
                self.queue.add(pod.key());
            }
        }
    }
}

impl EventHandler<Pod> for GcHandler {
    fn on_add(&self, pod: &Pod) {
        if !pod.metadata.owner_references.is_empty() {
            self.queue.add(pod.key());
        }
    }

    fn on_update(&self, _old: &Pod, new: &Pod) {
        self.on_add(new);
    }

    fn on_delete(&self, pod: &Pod) {
        // An owner waiting on its last dependent.
        for owner in &pod.metadata.owner_references {
            if owner.kind == ReplicaSet::KIND {
                self.queue.add(ObjectKey::new(
                    ReplicaSet::KIND,
                    pod.metadata.namespace.clone(),
                    owner.name.clone(),
                ));
            }
        }
    }
}

impl EventHandler<ReplicaSet> for GcHandler {
    fn on_add(&self, rs: &ReplicaSet) {
        if rs.metadata.is_deleting() {
            self.enqueue_owner(rs);
        }
    }

    fn on_update(&self, _old: &ReplicaSet, new: &ReplicaSet) {
        if new.metadata.is_deleting() {
            self.enqueue_owner(new);
        }
    }

    fn on_delete(&self, rs: &ReplicaSet) {
        self.enqueue_owner(rs);
    }
}
