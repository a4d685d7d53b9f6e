//! Scheduler reconciler: one pending pod per pass.
//!
//! The reconciler is responsible for:
//! - Reading the pod, nodes and bound pods from informer caches
//! - Running filter, score and bind for unbound pods
//! - Recording `PodScheduled` on the pod's status
//! - Nominating a node and evicting victims when preemption is needed

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use keel_api::id::ObjectUid;
use keel_api::{
    set_condition, Condition, ConditionStatus, Node, ObjectKey, Pod, Resource, POD_SCHEDULED,
    RECONCILE_FAILED,
};
use keel_reconcile::{Action, EventHandler, InformerStore, ReconcileError, Reconciler, WorkQueue};
use keel_store::Api;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, instrument, warn};

use super::filters::{run_filters, FilterFn, DEFAULT_FILTERS};
use super::framework::Snapshot;
use super::preemption::{eligible_to_preempt, find_candidate, Candidate};
use super::scoring::{score_nodes, select_host, ScorePlugin, ScoringWeights};
use super::{FitError, SchedulerError, SchedulerResult};

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub weights: ScoringWeights,
    /// Retry interval for pods no node can take.
    pub unschedulable_retry: Duration,
    /// Fixed tie-break seed; random when unset.
    pub seed: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            weights: ScoringWeights::default(),
            unschedulable_retry: Duration::from_secs(30),
            seed: None,
        }
    }
}

/// A preemption this scheduler issued: the pod's nomination and the
/// victims it has deleted so far.
#[derive(Debug, Clone)]
struct Nomination {
    uid: Option<ObjectUid>,
    node: String,
    victims: HashMap<ObjectKey, Option<ObjectUid>>,
}

/// Binds unscheduled pods to nodes.
pub struct Scheduler {
    pods: InformerStore<Pod>,
    nodes: InformerStore<Node>,
    api: Api<Pod>,
    filters: &'static [(&'static str, FilterFn)],
    plugins: Vec<ScorePlugin>,
    unschedulable_retry: Duration,
    rng: Mutex<StdRng>,
    /// Pods this scheduler bound that the pod cache has not caught up with.
    assumed: Mutex<HashMap<ObjectKey, Arc<Pod>>>,
    /// Preemptions the pod cache has not caught up with.
    nominations: Mutex<HashMap<ObjectKey, Nomination>>,
}

impl Scheduler {
    pub fn new(
        pods: InformerStore<Pod>,
        nodes: InformerStore<Node>,
        api: Api<Pod>,
        config: SchedulerConfig,
    ) -> Self {
        let rng = config
            .seed
            .map(StdRng::seed_from_u64)
            .unwrap_or_else(StdRng::from_os_rng);
        Self {
            pods,
            nodes,
            api,
            filters: DEFAULT_FILTERS,
            plugins: config.weights.plugins(),
            unschedulable_retry: config.unschedulable_retry,
            rng: Mutex::new(rng),
            assumed: Mutex::new(HashMap::new()),
            nominations: Mutex::new(HashMap::new()),
        }
    }

    /// Assumed pods still ahead of the cache. Entries the cache has caught
    /// up with, or whose pod is gone, are dropped.
    fn assumed_pods(&self) -> Vec<Arc<Pod>> {
        let mut assumed = self.assumed.lock().unwrap_or_else(PoisonError::into_inner);
        assumed.retain(|key, pod| match self.pods.get(key) {
            Some(cached) => {
                cached.metadata.uid == pod.metadata.uid
                    && cached.metadata.resource_version < pod.metadata.resource_version
            }
            None => false,
        });
        assumed.values().cloned().collect()
    }

    fn forget(&self, key: &ObjectKey) {
        self.assumed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        self.nominations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    /// Apply this scheduler's own nominations and evictions to pods whose
    /// cached copy does not show them yet.
    ///
    /// Entries are dropped once the cache shows the nomination and every
    /// victim as deleting or gone, or once the pod is bound or gone.
    fn with_nominations(&self, pods: Vec<Arc<Pod>>) -> Vec<Arc<Pod>> {
        let mut nominations = self
            .nominations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        nominations.retain(|key, nom| {
            let Some(pod) = self.pods.get(key) else {
                return false;
            };
            if pod.metadata.uid != nom.uid || pod.is_bound() || pod.metadata.is_deleting() {
                return false;
            }
            let nominated = pod.status.nominated_node_name.as_deref() == Some(nom.node.as_str());
            let evicted = nom.victims.iter().all(|(victim, uid)| {
                self.pods
                    .get(victim)
                    .is_none_or(|v| &v.metadata.uid != uid || v.metadata.is_deleting())
            });
            !(nominated && evicted)
        });
        if nominations.is_empty() {
            return pods;
        }

        let evicting: HashMap<&ObjectKey, Option<ObjectUid>> = nominations
            .values()
            .flat_map(|n| n.victims.iter().map(|(k, uid)| (k, *uid)))
            .collect();
        pods.into_iter()
            .map(|pod| {
                let key = pod.key();
                let nomination = nominations.get(&key).filter(|n| {
                    n.uid == pod.metadata.uid
                        && pod.status.nominated_node_name.as_deref() != Some(n.node.as_str())
                });
                let evicted = !pod.metadata.is_deleting()
                    && evicting.get(&key).is_some_and(|uid| *uid == pod.metadata.uid);
                if nomination.is_none() && !evicted {
                    return pod;
                }
                let mut pod = pod.as_ref().clone();
                if let Some(n) = nomination {
                    pod.status.nominated_node_name = Some(n.node.clone());
                }
                if evicted {
                    pod.metadata.deletion_timestamp = Some(Utc::now());
                }
                Arc::new(pod)
            })
            .collect()
    }

    /// The cached pod with this scheduler's own nomination applied.
    fn observe(&self, pod: Arc<Pod>) -> Arc<Pod> {
        self.with_nominations(vec![pod.clone()])
            .pop()
            .unwrap_or(pod)
    }

    fn is_assumed(&self, pod: &Pod) -> bool {
        self.assumed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&pod.key())
            .is_some_and(|a| a.metadata.uid == pod.metadata.uid)
    }

    /// Snapshot of the cluster as seen for `pod`.
    pub fn snapshot(&self, pod: &Pod) -> Snapshot {
        let assumed = self.with_nominations(self.assumed_pods());
        let pods = self.with_nominations(self.pods.list());
        Snapshot::build(&self.nodes.list(), &pods, &assumed, pod)
    }

    /// Pick a node for `pod`: its nominated node if that fits, otherwise
    /// the best-scoring feasible node.
    pub fn schedule_one(&self, pod: &Pod, snapshot: &Snapshot) -> SchedulerResult<String> {
        if let Some(node) = pod
            .status
            .nominated_node_name
            .as_deref()
            .and_then(|n| snapshot.get(n))
        {
            if run_filters(self.filters, pod, node, snapshot).is_ok() {
                return Ok(node.name().to_string());
            }
        }

        let mut feasible = Vec::new();
        let mut reasons = BTreeMap::new();
        for node in snapshot.nodes() {
            match run_filters(self.filters, pod, node, snapshot) {
                Ok(()) => feasible.push(node),
                Err(reason) => {
                    reasons.insert(node.name().to_string(), reason);
                }
            }
        }
        if feasible.is_empty() {
            return Err(FitError {
                num_nodes: snapshot.len(),
                reasons,
            }
            .into());
        }

        let totals = score_nodes(&self.plugins, pod, &feasible, snapshot);
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let idx = select_host(&totals, &mut *rng).unwrap_or(0);
        debug!(
            feasible = feasible.len(),
            score = totals[idx],
            node = feasible[idx].name(),
            "Scored nodes"
        );
        Ok(feasible[idx].name().to_string())
    }

    async fn bind(&self, pod: &Pod, node: &str) -> Result<Action, ReconcileError> {
        let mut bound = pod.clone();
        bound.spec.node_name = Some(node.to_string());
        match self.api.update(&bound).await {
            Ok(updated) => {
                info!(pod = %pod.key(), node, "Bound pod");
                self.assumed
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(updated.key(), Arc::new(updated.clone()));
                self.mark_scheduled(&updated).await
            }
            Err(e) if e.is_conflict() || e.is_not_found() => {
                // Someone else moved first. A still-unbound pod comes back
                // with its next change.
                debug!(pod = %pod.key(), error = %e, "Binding lost a race; dropping");
                Ok(Action::await_change())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Record a successful placement on the pod's status.
    async fn mark_scheduled(&self, pod: &Pod) -> Result<Action, ReconcileError> {
        let mut updated = pod.clone();
        let mut changed = set_condition(
            &mut updated.status.conditions,
            Condition::new(POD_SCHEDULED, ConditionStatus::True, "Scheduled", ""),
        );
        if updated.status.nominated_node_name.take().is_some() {
            changed = true;
        }
        if !changed {
            return Ok(Action::await_change());
        }
        match self.api.update_status(&updated).await {
            Ok(_) => Ok(Action::await_change()),
            Err(e) if e.is_not_found() => Ok(Action::await_change()),
            Err(e) => Err(e.into()),
        }
    }

    async fn handle_infeasible(
        &self,
        pod: &Pod,
        snapshot: &Snapshot,
        fit: FitError,
    ) -> Result<Action, ReconcileError> {
        if eligible_to_preempt(pod, snapshot) {
            if let Some(candidate) = find_candidate(pod, snapshot, self.filters) {
                return self.preempt(pod, candidate).await;
            }
        }

        info!(pod = %pod.key(), reason = %fit, "Pod is unschedulable");
        let mut updated = pod.clone();
        let changed = set_condition(
            &mut updated.status.conditions,
            Condition::new(
                POD_SCHEDULED,
                ConditionStatus::False,
                "Unschedulable",
                fit.to_string(),
            ),
        );
        if changed {
            match self.api.update_status(&updated).await {
                Ok(_) => {}
                Err(e) if e.is_conflict() || e.is_not_found() => {
                    debug!(pod = %pod.key(), error = %e, "Skipped unschedulable status");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Action::requeue(self.unschedulable_retry))
    }

    /// Nominate the node, then gracefully delete the victims. The
    /// nomination reserves the freed space against lower-priority pods.
    async fn preempt(&self, pod: &Pod, candidate: Candidate) -> Result<Action, ReconcileError> {
        let mut nominated = pod.clone();
        nominated.status.nominated_node_name = Some(candidate.node.clone());
        set_condition(
            &mut nominated.status.conditions,
            Condition::new(
                POD_SCHEDULED,
                ConditionStatus::False,
                "Preempting",
                format!(
                    "preempting {} pod(s) on node {}",
                    candidate.victims.len(),
                    candidate.node
                ),
            ),
        );
        match self.api.update_status(&nominated).await {
            Ok(_) => {}
            Err(e) if e.is_conflict() || e.is_not_found() => {
                debug!(pod = %pod.key(), error = %e, "Nomination lost a race; dropping");
                return Ok(Action::await_change());
            }
            Err(e) => return Err(e.into()),
        }
        let key = pod.key();
        self.remember_nomination(&key, pod, &candidate.node, None);

        for victim in &candidate.victims {
            match self.api.delete_object(victim).await {
                Ok(_) => {
                    self.remember_nomination(&key, pod, &candidate.node, Some(victim.as_ref()));
                    info!(
                        preemptor = %pod.key(),
                        victim = %victim.key(),
                        victim_priority = victim.spec.priority,
                        node = %candidate.node,
                        "Preempted pod"
                    );
                }
                Err(e) if e.is_not_found() || e.is_conflict() => {
                    debug!(victim = %victim.key(), error = %e, "Victim already gone");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Action::requeue(self.unschedulable_retry))
    }

    fn remember_nomination(&self, key: &ObjectKey, pod: &Pod, node: &str, victim: Option<&Pod>) {
        let mut nominations = self
            .nominations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let entry = nominations
            .entry(key.clone())
            .or_insert_with(|| Nomination {
                uid: pod.metadata.uid,
                node: node.to_string(),
                victims: HashMap::new(),
            });
        if entry.node != node || entry.uid != pod.metadata.uid {
            *entry = Nomination {
                uid: pod.metadata.uid,
                node: node.to_string(),
                victims: HashMap::new(),
            };
        }
        if let Some(victim) = victim {
            entry.victims.insert(victim.key(), victim.metadata.uid);
        }
    }
}

#[async_trait]
impl Reconciler for Scheduler {
    fn name(&self) -> &str {
        "scheduler"
    }

    #[instrument(skip_all, fields(pod = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let Some(pod) = self.pods.get(key) else {
            self.forget(key);
            return Ok(Action::await_change());
        };
        if pod.metadata.is_deleting() || pod.is_terminal() {
            self.forget(key);
            return Ok(Action::await_change());
        }
        if pod.is_bound() {
            return self.mark_scheduled(&pod).await;
        }
        if self.is_assumed(&pod) {
            return Ok(Action::await_change());
        }
        let pod = self.observe(pod);

        let snapshot = self.snapshot(&pod);
        match self.schedule_one(&pod, &snapshot) {
            Ok(node) => self.bind(&pod, &node).await,
            Err(SchedulerError::Infeasible(fit)) => {
                self.handle_infeasible(&pod, &snapshot, fit).await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Record the failure as `PodScheduled=False` so it is visible on the
    /// pod itself. A later successful bind overwrites it.
    async fn on_poison(&self, key: &ObjectKey, error: &ReconcileError) -> Result<(), ReconcileError> {
        warn!(pod = %key, error = %error, "Giving up on pod");
        let Some(mut pod) = self.api.within(&key.namespace).get_opt(&key.name).await? else {
            return Ok(());
        };
        if pod.is_bound() || pod.metadata.is_deleting() {
            return Ok(());
        }
        let changed = set_condition(
            &mut pod.status.conditions,
            Condition::new(
                POD_SCHEDULED,
                ConditionStatus::False,
                RECONCILE_FAILED,
                error.to_string(),
            ),
        );
        if changed {
            self.api.update_status(&pod).await?;
        }
        Ok(())
    }
}

/// Feeds the scheduler's queue.
///
/// Unbound pods are enqueued on every change. Anything that may free or
/// add capacity (a node change, a bound pod leaving) re-enqueues every
/// pending pod.
pub struct SchedulingHandler {
    queue: WorkQueue<ObjectKey>,
    pods: InformerStore<Pod>,
}

impl SchedulingHandler {
    pub fn new(queue: WorkQueue<ObjectKey>, pods: InformerStore<Pod>) -> Arc<Self> {
        Arc::new(Self { queue, pods })
    }

    fn wants(pod: &Pod) -> bool {
        if pod.metadata.is_deleting() || pod.is_terminal() {
            return false;
        }
        !pod.is_bound()
            || pod
                .condition(POD_SCHEDULED)
                .is_none_or(|c| c.status != ConditionStatus::True)
            || pod.status.nominated_node_name.is_some()
    }

    fn enqueue_pending(&self) {
        for pod in self.pods.list() {
            if !pod.is_bound() && !pod.metadata.is_deleting() {
                self.queue.add(pod.key());
            }
        }
    }

    /// Whether `pod` leaving frees capacity someone may be waiting for.
    fn held_capacity(pod: &Pod) -> bool {
        pod.is_bound() || pod.status.nominated_node_name.is_some()
    }
}

impl EventHandler<Pod> for SchedulingHandler {
    fn on_add(&self, pod: &Pod) {
        if Self::wants(pod) {
            self.queue.add(pod.key());
        }
    }

    fn on_update(&self, old: &Pod, new: &Pod) {
        if Self::wants(new) {
            self.queue.add(new.key());
        }
        let released = Self::held_capacity(old)
            && (new.is_terminal() || new.metadata.is_deleting())
            && !(old.is_terminal() || old.metadata.is_deleting());
        if released {
            self.enqueue_pending();
        }
    }

    fn on_delete(&self, pod: &Pod) {
        self.queue.add(pod.key());
        if Self::held_capacity(pod) {
            self.enqueue_pending();
        }
    }
}

impl EventHandler<Node> for SchedulingHandler {
    fn on_add(&self, _node: &Node) {
        self.enqueue_pending();
    }

    fn on_update(&self, _old: &Node, _new: &Node) {
        self.enqueue_pending();
    }

    fn on_delete(&self, _node: &Node) {}
}
