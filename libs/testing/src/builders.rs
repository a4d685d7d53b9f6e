use chrono::Utc;
use keel_api::{
    Condition, ConditionStatus, Container, ContainerPort, LabelSelector, Node, Pod,
    PodAffinityTerm, PodPhase, PodTemplateSpec, ReplicaSet, ReplicaSetSpec, ResourceList, Taint,
    TaintEffect, TemplateMeta, Toleration, TolerationOperator, NODE_READY,
};

const GIB: u64 = 1024 * 1024 * 1024;

/// Builds a ready node with the given allocatable resources.
#[derive(Debug, Clone)]
pub struct NodeBuilder {
    node: Node,
}

impl NodeBuilder {
    /// A ready node with 4 CPUs, 8 GiB and 110 pod slots.
    pub fn new(name: &str) -> Self {
        let mut node = Node::new(name);
        let resources = ResourceList::new(4000, 8 * GIB, 110);
        node.status.capacity = resources;
        node.status.allocatable = resources;
        node.status.last_heartbeat_time = Some(Utc::now());
        node.status.conditions.push(Condition::new(
            NODE_READY,
            ConditionStatus::True,
            "HeartbeatReceived",
            "",
        ));
        Self { node }
    }

    pub fn cpu_millis(mut self, millis: u64) -> Self {
        self.node.status.capacity.cpu_millis = millis;
        self.node.status.allocatable.cpu_millis = millis;
        self
    }

    pub fn memory_bytes(mut self, bytes: u64) -> Self {
        self.node.status.capacity.memory_bytes = bytes;
        self.node.status.allocatable.memory_bytes = bytes;
        self
    }

    pub fn max_pods(mut self, pods: u64) -> Self {
        self.node.status.capacity.pods = pods;
        self.node.status.allocatable.pods = pods;
        self
    }

    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.node
            .metadata
            .labels
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn taint(mut self, key: &str, value: &str, effect: TaintEffect) -> Self {
        self.node.spec.taints.push(Taint {
            key: key.to_string(),
            value: value.to_string(),
            effect,
            time_added: None,
        });
        self
    }

    pub fn unschedulable(mut self) -> Self {
        self.node.spec.unschedulable = true;
        self
    }

    pub fn build(self) -> Node {
        self.node
    }
}

/// Builds a single-container pod.
#[derive(Debug, Clone)]
pub struct PodBuilder {
    pod: Pod,
}

impl PodBuilder {
    pub fn new(namespace: &str, name: &str) -> Self {
        let mut pod = Pod::new(namespace, name);
        pod.spec.containers.push(Container {
            name: "main".to_string(),
            image: "registry.local/app:1".to_string(),
            ..Default::default()
        });
        Self { pod }
    }

    fn container(&mut self) -> &mut Container {
        &mut self.pod.spec.containers[0]
    }

    pub fn cpu_millis(mut self, millis: u64) -> Self {
        self.container().requests.cpu_millis = millis;
        self
    }

    pub fn memory_bytes(mut self, bytes: u64) -> Self {
        self.container().requests.memory_bytes = bytes;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.pod.spec.priority = priority;
        self
    }

    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.pod
            .metadata
            .labels
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn node_selector(mut self, key: &str, value: &str) -> Self {
        self.pod
            .spec
            .node_selector
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn host_port(mut self, port: u16) -> Self {
        self.container().ports.push(ContainerPort {
            container_port: port,
            host_port: Some(port),
            ..Default::default()
        });
        self
    }

    pub fn tolerate(mut self, key: &str, effect: Option<TaintEffect>) -> Self {
        self.pod.spec.tolerations.push(Toleration {
            key: key.to_string(),
            operator: TolerationOperator::Exists,
            value: String::new(),
            effect,
        });
        self
    }

    /// Required anti-affinity against pods matching `labels` per `topology_key`.
    pub fn anti_affinity(mut self, labels: &[(&str, &str)], topology_key: &str) -> Self {
        let term = PodAffinityTerm {
            label_selector: LabelSelector::from_labels(labels.iter().copied()),
            topology_key: topology_key.to_string(),
            namespaces: Vec::new(),
        };
        self.pod
            .spec
            .affinity
            .get_or_insert_with(Default::default)
            .pod_anti_affinity
            .get_or_insert_with(Default::default)
            .required
            .push(term);
        self
    }

    /// Required affinity to pods matching `labels` per `topology_key`.
    pub fn affinity(mut self, labels: &[(&str, &str)], topology_key: &str) -> Self {
        let term = PodAffinityTerm {
            label_selector: LabelSelector::from_labels(labels.iter().copied()),
            topology_key: topology_key.to_string(),
            namespaces: Vec::new(),
        };
        self.pod
            .spec
            .affinity
            .get_or_insert_with(Default::default)
            .pod_affinity
            .get_or_insert_with(Default::default)
            .required
            .push(term);
        self
    }

    /// Already bound to `node`.
    pub fn bound_to(mut self, node: &str) -> Self {
        self.pod.spec.node_name = Some(node.to_string());
        self
    }

    pub fn phase(mut self, phase: PodPhase) -> Self {
        self.pod.status.phase = phase;
        self
    }

    pub fn build(self) -> Pod {
        self.pod
    }
}

/// Builds a replica set whose template carries `app=<name>`.
#[derive(Debug, Clone)]
pub struct ReplicaSetBuilder {
    rs: ReplicaSet,
}

impl ReplicaSetBuilder {
    pub fn new(namespace: &str, name: &str, replicas: u32) -> Self {
        let template = PodBuilder::new(namespace, name).cpu_millis(100).build();
        let mut meta = TemplateMeta::default();
        meta.labels.insert("app".to_string(), name.to_string());
        let spec = ReplicaSetSpec {
            replicas,
            selector: LabelSelector::from_labels([("app", name)]),
            template: PodTemplateSpec {
                metadata: meta,
                spec: template.spec,
            },
        };
        Self {
            rs: ReplicaSet::new(namespace, name, spec),
        }
    }

    pub fn cpu_millis(mut self, millis: u64) -> Self {
        if let Some(container) = self.rs.spec.template.spec.containers.first_mut() {
            container.requests.cpu_millis = millis;
        }
        self
    }

    pub fn image(mut self, image: &str) -> Self {
        if let Some(container) = self.rs.spec.template.spec.containers.first_mut() {
            container.image = image.to_string();
        }
        self
    }

    pub fn build(self) -> ReplicaSet {
        self.rs
    }
}
