//! Hard placement constraints.
//!
//! Each filter inspects one candidate node and either accepts it or returns
//! a human-readable reason. A node is feasible only if every filter accepts.

use keel_api::{Pod, PodAffinityTerm, Taint, TaintEffect, TAINT_NODE_UNSCHEDULABLE};

use super::framework::{NodeInfo, Snapshot};

/// A filter: `Ok` keeps the node, `Err(reason)` eliminates it.
pub type FilterFn = fn(&Pod, &NodeInfo, &Snapshot) -> Result<(), String>;

/// Filters in evaluation order. Cheap node-local checks come first.
pub const DEFAULT_FILTERS: &[(&str, FilterFn)] = &[
    ("NodeReady", node_ready),
    ("NodeUnschedulable", node_unschedulable),
    ("NodeResourcesFit", resources_fit),
    ("TaintToleration", taint_toleration),
    ("NodeAffinity", node_affinity),
    ("NodePorts", node_ports),
    ("InterPodAffinity", inter_pod_affinity),
];

/// Run every filter, returning the first rejection.
pub fn run_filters(
    filters: &[(&str, FilterFn)],
    pod: &Pod,
    node: &NodeInfo,
    snapshot: &Snapshot,
) -> Result<(), String> {
    filters.iter().try_for_each(|(_, f)| f(pod, node, snapshot))
}

pub fn node_ready(_pod: &Pod, node: &NodeInfo, _snapshot: &Snapshot) -> Result<(), String> {
    if node.node().is_ready() {
        Ok(())
    } else {
        Err("node(s) were not ready".to_string())
    }
}

pub fn node_unschedulable(pod: &Pod, node: &NodeInfo, _snapshot: &Snapshot) -> Result<(), String> {
    if !node.node().spec.unschedulable {
        return Ok(());
    }
    let cordon = Taint::new(TAINT_NODE_UNSCHEDULABLE, TaintEffect::NoSchedule);
    if pod.tolerates(&cordon) {
        Ok(())
    } else {
        Err("node(s) were unschedulable".to_string())
    }
}

pub fn resources_fit(pod: &Pod, node: &NodeInfo, _snapshot: &Snapshot) -> Result<(), String> {
    let short = node
        .allocatable()
        .insufficient(&node.requested(), &pod.total_requests());
    if short.is_empty() {
        return Ok(());
    }
    let names: Vec<String> = short.iter().map(|r| format!("Insufficient {r}")).collect();
    Err(names.join(", "))
}

pub fn taint_toleration(pod: &Pod, node: &NodeInfo, _snapshot: &Snapshot) -> Result<(), String> {
    match node
        .node()
        .spec
        .taints
        .iter()
        .find(|t| t.blocks_scheduling() && !pod.tolerates(t))
    {
        None => Ok(()),
        Some(taint) => Err(format!("node(s) had untolerated taint {{{}}}", taint.key)),
    }
}

/// `nodeSelector` plus required node affinity (terms ORed).
pub fn node_affinity(pod: &Pod, node: &NodeInfo, _snapshot: &Snapshot) -> Result<(), String> {
    let labels = &node.node().metadata.labels;
    let selector_ok = pod
        .spec
        .node_selector
        .iter()
        .all(|(k, v)| labels.get(k) == Some(v));
    let required = pod
        .spec
        .affinity
        .as_ref()
        .and_then(|a| a.node_affinity.as_ref())
        .map(|na| na.required.as_slice())
        .unwrap_or_default();
    let affinity_ok = required.is_empty() || required.iter().any(|t| t.matches(labels));

    if selector_ok && affinity_ok {
        Ok(())
    } else {
        Err("node(s) didn't match node selector".to_string())
    }
}

pub fn node_ports(pod: &Pod, node: &NodeInfo, _snapshot: &Snapshot) -> Result<(), String> {
    if pod.host_ports().into_iter().any(|p| node.port_in_use(p)) {
        Err("node(s) didn't have free ports for the requested pod ports".to_string())
    } else {
        Ok(())
    }
}

/// Whether `a` and `b` share a topology domain for `key`.
fn same_domain(a: &NodeInfo, b: &NodeInfo, key: &str) -> bool {
    match (a.topology_value(key), b.topology_value(key)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

/// Pods counted on nodes sharing `node`'s domain for `term`, selected by it.
fn matches_in_domain<'a>(
    term: &'a PodAffinityTerm,
    owner_namespace: &'a str,
    node: &'a NodeInfo,
    snapshot: &'a Snapshot,
) -> impl Iterator<Item = &'a Pod> + 'a {
    snapshot
        .nodes()
        .iter()
        .filter(move |other| same_domain(node, other, &term.topology_key))
        .flat_map(|other| other.pods().iter())
        .map(|p| &**p)
        .filter(move |p| term.selects(owner_namespace, p))
}

/// Required pod affinity and anti-affinity, including the anti-affinity of
/// pods already placed towards the incoming pod.
pub fn inter_pod_affinity(pod: &Pod, node: &NodeInfo, snapshot: &Snapshot) -> Result<(), String> {
    let ns = pod.metadata.namespace.as_str();
    let affinity = pod.spec.affinity.as_ref();

    let anti = affinity
        .and_then(|a| a.pod_anti_affinity.as_ref())
        .map(|p| p.required.as_slice())
        .unwrap_or_default();
    for term in anti {
        if matches_in_domain(term, ns, node, snapshot).next().is_some() {
            return Err("node(s) didn't match pod anti-affinity rules".to_string());
        }
    }

    for other_node in snapshot.nodes() {
        for existing in other_node.pods() {
            let Some(existing_anti) = existing
                .spec
                .affinity
                .as_ref()
                .and_then(|a| a.pod_anti_affinity.as_ref())
            else {
                continue;
            };
            let violated = existing_anti.required.iter().any(|term| {
                same_domain(node, other_node, &term.topology_key)
                    && term.selects(&existing.metadata.namespace, pod)
            });
            if violated {
                return Err("node(s) didn't satisfy existing pods anti-affinity rules".to_string());
            }
        }
    }

    let required = affinity
        .and_then(|a| a.pod_affinity.as_ref())
        .map(|p| p.required.as_slice())
        .unwrap_or_default();
    for term in required {
        if matches_in_domain(term, ns, node, snapshot).next().is_some() {
            continue;
        }
        // The first pod of a group that selects itself may go anywhere the
        // topology key exists; otherwise nothing could ever be placed.
        let any_match = snapshot
            .nodes()
            .iter()
            .flat_map(|n| n.pods().iter())
            .any(|p| term.selects(ns, p));
        let self_match = term.selects(ns, pod);
        if any_match || !self_match || node.topology_value(&term.topology_key).is_none() {
            return Err("node(s) didn't match pod affinity rules".to_string());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use keel_api::{
        Affinity, LabelSelectorRequirement, NodeAffinity, NodeSelectorTerm, SelectorOperator,
        LABEL_HOSTNAME,
    };
    use keel_testing::{NodeBuilder, PodBuilder};
    use rstest::rstest;

    fn snapshot(nodes: Vec<keel_api::Node>, pods: Vec<Pod>, incoming: &Pod) -> Snapshot {
        let nodes: Vec<_> = nodes.into_iter().map(Arc::new).collect();
        let pods: Vec<_> = pods.into_iter().map(Arc::new).collect();
        Snapshot::build(&nodes, &pods, &[], incoming)
    }

    #[rstest]
    #[case(1000, 999, true)]
    #[case(1000, 1000, true)]
    #[case(1000, 1001, false)]
    fn test_resources_fit_boundary(#[case] alloc: u64, #[case] request: u64, #[case] fits: bool) {
        let pod = PodBuilder::new("default", "p").cpu_millis(request).build();
        let snap = snapshot(vec![NodeBuilder::new("a").cpu_millis(alloc).build()], vec![], &pod);
        assert_eq!(resources_fit(&pod, snap.get("a").unwrap(), &snap).is_ok(), fits);
    }

    #[test]
    fn test_resources_fit_counts_bound_pods() {
        let pod = PodBuilder::new("default", "p").cpu_millis(600).build();
        let existing = PodBuilder::new("default", "e").cpu_millis(500).bound_to("a").build();
        let snap = snapshot(
            vec![NodeBuilder::new("a").cpu_millis(1000).build()],
            vec![existing],
            &pod,
        );
        let err = resources_fit(&pod, snap.get("a").unwrap(), &snap).unwrap_err();
        assert_eq!(err, "Insufficient cpu");
    }

    #[test]
    fn test_pod_slots_are_a_resource() {
        let pod = PodBuilder::new("default", "p").build();
        let existing = PodBuilder::new("default", "e").bound_to("a").build();
        let snap = snapshot(vec![NodeBuilder::new("a").max_pods(1).build()], vec![existing], &pod);
        assert_eq!(
            resources_fit(&pod, snap.get("a").unwrap(), &snap).unwrap_err(),
            "Insufficient pods"
        );
    }

    #[rstest]
    #[case(TaintEffect::NoSchedule, None, false)]
    #[case(TaintEffect::NoExecute, None, false)]
    #[case(TaintEffect::PreferNoSchedule, None, true)]
    #[case(TaintEffect::NoSchedule, Some(Some(TaintEffect::NoSchedule)), true)]
    #[case(TaintEffect::NoExecute, Some(Some(TaintEffect::NoSchedule)), false)]
    #[case(TaintEffect::NoExecute, Some(None), true)]
    fn test_taint_toleration(
        #[case] effect: TaintEffect,
        #[case] tolerated: Option<Option<TaintEffect>>,
        #[case] feasible: bool,
    ) {
        let mut builder = PodBuilder::new("default", "p");
        if let Some(toleration_effect) = tolerated {
            builder = builder.tolerate("dedicated", toleration_effect);
        }
        let pod = builder.build();
        let node = NodeBuilder::new("a").taint("dedicated", "gpu", effect).build();
        let snap = snapshot(vec![node], vec![], &pod);
        assert_eq!(taint_toleration(&pod, snap.get("a").unwrap(), &snap).is_ok(), feasible);
    }

    #[test]
    fn test_unready_and_cordoned_nodes_rejected() {
        let pod = PodBuilder::new("default", "p").build();
        let mut unready = NodeBuilder::new("a").build();
        unready.status.conditions.clear();
        let cordoned = NodeBuilder::new("b").unschedulable().build();
        let snap = snapshot(vec![unready, cordoned], vec![], &pod);

        assert!(node_ready(&pod, snap.get("a").unwrap(), &snap).is_err());
        assert!(node_unschedulable(&pod, snap.get("b").unwrap(), &snap).is_err());

        let tolerant = PodBuilder::new("default", "t")
            .tolerate(TAINT_NODE_UNSCHEDULABLE, None)
            .build();
        assert!(node_unschedulable(&tolerant, snap.get("b").unwrap(), &snap).is_ok());
    }

    #[test]
    fn test_node_selector_and_required_affinity() {
        let mut pod = PodBuilder::new("default", "p").node_selector("disk", "ssd").build();
        let ssd = NodeBuilder::new("a").label("disk", "ssd").label("zone", "z1").build();
        let hdd = NodeBuilder::new("b").label("disk", "hdd").build();
        let snap = snapshot(vec![ssd, hdd], vec![], &pod);
        assert!(node_affinity(&pod, snap.get("a").unwrap(), &snap).is_ok());
        assert!(node_affinity(&pod, snap.get("b").unwrap(), &snap).is_err());

        pod.spec.affinity = Some(Affinity {
            node_affinity: Some(NodeAffinity {
                required: vec![NodeSelectorTerm {
                    match_expressions: vec![LabelSelectorRequirement {
                        key: "zone".to_string(),
                        operator: SelectorOperator::In,
                        values: vec!["z2".to_string()],
                    }],
                }],
                preferred: Vec::new(),
            }),
            ..Default::default()
        });
        assert!(node_affinity(&pod, snap.get("a").unwrap(), &snap).is_err());
    }

    #[test]
    fn test_host_port_conflict() {
        let pod = PodBuilder::new("default", "p").host_port(443).build();
        let existing = PodBuilder::new("default", "e").host_port(443).bound_to("a").build();
        let snap = snapshot(
            vec![NodeBuilder::new("a").build(), NodeBuilder::new("b").build()],
            vec![existing],
            &pod,
        );
        assert!(node_ports(&pod, snap.get("a").unwrap(), &snap).is_err());
        assert!(node_ports(&pod, snap.get("b").unwrap(), &snap).is_ok());
    }

    #[test]
    fn test_required_anti_affinity_spreads_by_hostname() {
        let pod = PodBuilder::new("default", "web-2")
            .label("app", "web")
            .anti_affinity(&[("app", "web")], LABEL_HOSTNAME)
            .build();
        let existing = PodBuilder::new("default", "web-1")
            .label("app", "web")
            .bound_to("a")
            .build();
        let snap = snapshot(
            vec![NodeBuilder::new("a").build(), NodeBuilder::new("b").build()],
            vec![existing],
            &pod,
        );
        assert!(inter_pod_affinity(&pod, snap.get("a").unwrap(), &snap).is_err());
        assert!(inter_pod_affinity(&pod, snap.get("b").unwrap(), &snap).is_ok());
    }

    #[test]
    fn test_existing_pod_anti_affinity_is_symmetric() {
        let existing = PodBuilder::new("default", "db")
            .label("app", "db")
            .anti_affinity(&[("app", "batch")], "zone")
            .bound_to("a")
            .build();
        let pod = PodBuilder::new("default", "job").label("app", "batch").build();
        let snap = snapshot(
            vec![
                NodeBuilder::new("a").label("zone", "z1").build(),
                NodeBuilder::new("b").label("zone", "z1").build(),
                NodeBuilder::new("c").label("zone", "z2").build(),
            ],
            vec![existing],
            &pod,
        );
        assert!(inter_pod_affinity(&pod, snap.get("b").unwrap(), &snap).is_err());
        assert!(inter_pod_affinity(&pod, snap.get("c").unwrap(), &snap).is_ok());
    }

    #[test]
    fn test_required_affinity_follows_peers_into_zone() {
        let cache = PodBuilder::new("default", "cache")
            .label("app", "cache")
            .bound_to("a")
            .build();
        let pod = PodBuilder::new("default", "web")
            .affinity(&[("app", "cache")], "zone")
            .build();
        let snap = snapshot(
            vec![
                NodeBuilder::new("a").label("zone", "z1").build(),
                NodeBuilder::new("b").label("zone", "z1").build(),
                NodeBuilder::new("c").label("zone", "z2").build(),
            ],
            vec![cache],
            &pod,
        );
        assert!(inter_pod_affinity(&pod, snap.get("b").unwrap(), &snap).is_ok());
        assert!(inter_pod_affinity(&pod, snap.get("c").unwrap(), &snap).is_err());
    }

    #[test]
    fn test_first_pod_of_self_affine_group_is_placeable() {
        let pod = PodBuilder::new("default", "web-0")
            .label("app", "web")
            .affinity(&[("app", "web")], "zone")
            .build();
        let snap = snapshot(vec![NodeBuilder::new("a").label("zone", "z1").build()], vec![], &pod);
        assert!(inter_pod_affinity(&pod, snap.get("a").unwrap(), &snap).is_ok());
    }
}
