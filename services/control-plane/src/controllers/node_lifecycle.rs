//! Node lifecycle controller.
//!
//! Watches node heartbeats. A node silent for longer than the grace period
//! is marked `Ready=Unknown`; one that stays unknown past the eviction
//! timeout gets the unreachable `NoExecute` taint and loses every pod that
//! does not tolerate it. Both marks are lifted when heartbeats resume.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_api::{
    remove_condition, set_condition, Condition, ConditionStatus, Node, ObjectKey, Pod, Resource,
    Taint, TaintEffect, NODE_READY, RECONCILE_FAILED, TAINT_NODE_UNREACHABLE,
};
use keel_reconcile::{Action, InformerStore, ReconcileError, Reconciler};
use keel_store::Api;
use tracing::{debug, info, instrument, warn};

const REASON_UNKNOWN: &str = "NodeStatusUnknown";
const REASON_RESUMED: &str = "NodeStatusResumed";
const REASON_MONITOR_FAILED: &str = "NodeMonitorFailed";

#[derive(Debug, Clone)]
pub struct NodeLifecycleConfig {
    /// How often every node is re-examined.
    pub monitor_period: Duration,
    /// Heartbeat age after which a node is considered unknown.
    pub grace_period: Duration,
    /// Time unknown before pods are evicted.
    pub eviction_timeout: Duration,
}

impl Default for NodeLifecycleConfig {
    fn default() -> Self {
        Self {
            monitor_period: Duration::from_secs(5),
            grace_period: Duration::from_secs(40),
            eviction_timeout: Duration::from_secs(5 * 60),
        }
    }
}

pub struct NodeLifecycleController {
    nodes: InformerStore<Node>,
    pods: InformerStore<Pod>,
    node_api: Api<Node>,
    pod_api: Api<Pod>,
    config: NodeLifecycleConfig,
}

impl NodeLifecycleController {
    pub fn new(
        nodes: InformerStore<Node>,
        pods: InformerStore<Pod>,
        node_api: Api<Node>,
        pod_api: Api<Pod>,
        config: NodeLifecycleConfig,
    ) -> Self {
        Self {
            nodes,
            pods,
            node_api,
            pod_api,
            config,
        }
    }

    async fn mark_unknown(&self, node: &Node, age: Duration) -> Result<(), ReconcileError> {
        let mut next = node.clone();
        let changed = set_condition(
            &mut next.status.conditions,
            Condition::new(
                NODE_READY,
                ConditionStatus::Unknown,
                REASON_UNKNOWN,
                format!("no heartbeat for {}s", age.as_secs()),
            ),
        );
        if changed {
            self.node_api.update_status(&next).await?;
            warn!(age_secs = age.as_secs(), "Node stopped reporting");
        }
        Ok(())
    }

    async fn taint_and_evict(&self, node: &Node) -> Result<(), ReconcileError> {
        let taint = unreachable_taint();
        if node.taint(TAINT_NODE_UNREACHABLE).is_none() {
            let mut next = node.clone();
            next.spec.taints.push(Taint {
                time_added: Some(Utc::now()),
                ..taint.clone()
            });
            self.node_api.update(&next).await?;
            info!("Tainted unreachable node");
        }

        let name = node.metadata.name.as_str();
        let victims: Vec<Arc<Pod>> = self
            .pods
            .list()
            .into_iter()
            .filter(|p| p.spec.node_name.as_deref() == Some(name))
            .filter(|p| !p.metadata.is_deleting() && !p.is_terminal())
            .filter(|p| !p.tolerates(&taint))
            .collect();
        for pod in victims {
            match self.pod_api.delete_object(&pod).await {
                Ok(_) => info!(pod = %pod.key(), "Evicted pod from unreachable node"),
                Err(e) if e.is_not_found() || e.is_conflict() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn recover(&self, node: &Node) -> Result<(), ReconcileError> {
        let mut current = node.clone();
        if current.taint(TAINT_NODE_UNREACHABLE).is_some() {
            current.spec.taints.retain(|t| t.key != TAINT_NODE_UNREACHABLE);
            current = self.node_api.update(&current).await?;
            info!("Removed unreachable taint");
        }
        let set_by_us = current
            .condition(NODE_READY)
            .is_some_and(|c| c.status == ConditionStatus::Unknown && c.reason == REASON_UNKNOWN);
        if set_by_us {
            set_condition(
                &mut current.status.conditions,
                Condition::new(NODE_READY, ConditionStatus::True, REASON_RESUMED, ""),
            );
            self.node_api.update_status(&current).await?;
            info!("Node heartbeat resumed");
        }
        Ok(())
    }

    /// Drop a failure mark left by an earlier give-up.
    async fn clear_failure(&self, node: &Node) -> Result<(), ReconcileError> {
        if node.condition(RECONCILE_FAILED).is_none() {
            return Ok(());
        }
        let Some(mut live) = self.node_api.get_opt(&node.metadata.name).await? else {
            return Ok(());
        };
        if remove_condition(&mut live.status.conditions, RECONCILE_FAILED) {
            self.node_api.update_status(&live).await?;
            info!("Node monitoring recovered");
        }
        Ok(())
    }
}

#[async_trait]
impl Reconciler for NodeLifecycleController {
    fn name(&self) -> &str {
        "node-lifecycle"
    }

    #[instrument(skip_all, fields(node = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let Some(node) = self.nodes.get(key) else {
            return Ok(Action::await_change());
        };
        let now = Utc::now();
        let age = heartbeat_age(&node, now);

        if age <= self.config.grace_period {
            self.recover(&node).await?;
        } else {
            match unknown_for(&node, now) {
                None => self.mark_unknown(&node, age).await?,
                Some(unknown) if unknown >= self.config.eviction_timeout => {
                    self.taint_and_evict(&node).await?
                }
                Some(unknown) => debug!(unknown_secs = unknown.as_secs(), "Node still unknown"),
            }
        }
        self.clear_failure(&node).await?;
        Ok(Action::requeue(self.config.monitor_period))
    }

    async fn on_poison(&self, key: &ObjectKey, error: &ReconcileError) -> Result<(), ReconcileError> {
        warn!(node = %key, error = %error, "Giving up on node");
        let Some(mut node) = self.node_api.get_opt(&key.name).await? else {
            return Ok(());
        };
        let changed = set_condition(
            &mut node.status.conditions,
            Condition::new(
                RECONCILE_FAILED,
                ConditionStatus::True,
                REASON_MONITOR_FAILED,
                error.to_string(),
            ),
        );
        if changed {
            self.node_api.update_status(&node).await?;
        }
        Ok(())
    }
}

fn unreachable_taint() -> Taint {
    Taint::new(TAINT_NODE_UNREACHABLE, TaintEffect::NoExecute)
}

fn since(earlier: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - earlier).to_std().unwrap_or_default()
}

/// Time since the last heartbeat, or since creation if none arrived yet.
fn heartbeat_age(node: &Node, now: DateTime<Utc>) -> Duration {
    node.status
        .last_heartbeat_time
        .or(node.metadata.creation_timestamp)
        .map_or(Duration::ZERO, |t| since(t, now))
}

/// How long the node has been `Ready=Unknown`, if it is.
fn unknown_for(node: &Node, now: DateTime<Utc>) -> Option<Duration> {
    node.condition(NODE_READY)
        .filter(|c| c.status == ConditionStatus::Unknown)
        .map(|c| since(c.last_transition_time, now))
}
