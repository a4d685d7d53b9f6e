//! Cluster snapshot the scheduling pipeline runs over.
//!
//! A [`Snapshot`] is an arena of [`NodeInfo`] entries plus a name index,
//! built once per scheduling attempt from the informer caches. Filters and
//! scorers are plain functions over it, so each can be tested in isolation
//! against a hand-built snapshot.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use keel_api::{Node, ObjectKey, Pod, Protocol, Resource, ResourceList};

/// One node and the pods counted against it.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    node: Arc<Node>,
    pods: Vec<Arc<Pod>>,
    requested: ResourceList,
    ports: BTreeSet<(Protocol, u16)>,
}

impl NodeInfo {
    pub fn new(node: Arc<Node>) -> Self {
        Self {
            node,
            pods: Vec::new(),
            requested: ResourceList::default(),
            ports: BTreeSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.node.metadata.name
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn pods(&self) -> &[Arc<Pod>] {
        &self.pods
    }

    /// Sum of requests of every counted pod.
    pub fn requested(&self) -> ResourceList {
        self.requested
    }

    pub fn allocatable(&self) -> ResourceList {
        self.node.status.allocatable
    }

    pub fn port_in_use(&self, port: (Protocol, u16)) -> bool {
        self.ports.contains(&port)
    }

    pub fn add_pod(&mut self, pod: Arc<Pod>) {
        self.requested = self.requested.add(&pod.total_requests());
        self.ports.extend(pod.host_ports());
        self.pods.push(pod);
    }

    /// Remove a pod by key. Returns it if it was counted here.
    pub fn remove_pod(&mut self, key: &ObjectKey) -> Option<Arc<Pod>> {
        let idx = self.pods.iter().position(|p| &p.key() == key)?;
        let pod = self.pods.remove(idx);
        self.recompute();
        Some(pod)
    }

    fn recompute(&mut self) {
        self.requested = ResourceList::default();
        self.ports.clear();
        for pod in &self.pods {
            self.requested = self.requested.add(&pod.total_requests());
            self.ports.extend(pod.host_ports());
        }
    }

    /// Value of the topology label `key` on this node.
    pub fn topology_value(&self, key: &str) -> Option<&str> {
        self.node.metadata.labels.get(key).map(String::as_str)
    }
}

/// Point-in-time view of nodes and their pods.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    nodes: Vec<NodeInfo>,
    index: HashMap<String, usize>,
}

impl Snapshot {
    /// Build a snapshot for scheduling `incoming`.
    ///
    /// Counted against a node: pods bound to it that still hold resources,
    /// pods `assumed` bound by this scheduler but not yet observed, and pods
    /// nominated to it with priority at least that of `incoming`. The
    /// incoming pod itself is never counted.
    pub fn build(
        nodes: &[Arc<Node>],
        pods: &[Arc<Pod>],
        assumed: &[Arc<Pod>],
        incoming: &Pod,
    ) -> Self {
        let mut snapshot = Self::default();
        for node in nodes {
            snapshot.insert(NodeInfo::new(node.clone()));
        }

        let incoming_key = incoming.key();
        let mut seen = BTreeSet::new();
        for pod in assumed.iter().chain(pods.iter()) {
            let key = pod.key();
            if key == incoming_key || pod.is_terminal() || !seen.insert(key) {
                continue;
            }
            let target = match (&pod.spec.node_name, &pod.status.nominated_node_name) {
                (Some(node), _) => Some(node),
                (None, Some(nominated)) if pod.spec.priority >= incoming.spec.priority => {
                    Some(nominated)
                }
                _ => None,
            };
            if let Some(info) = target.and_then(|name| snapshot.get_mut(name)) {
                info.add_pod(pod.clone());
            }
        }
        snapshot
    }

    fn insert(&mut self, info: NodeInfo) {
        self.index.insert(info.name().to_string(), self.nodes.len());
        self.nodes.push(info);
    }

    pub fn nodes(&self) -> &[NodeInfo] {
        &self.nodes
    }

    pub fn get(&self, name: &str) -> Option<&NodeInfo> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut NodeInfo> {
        self.index.get(name).map(|&i| &mut self.nodes[i])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
