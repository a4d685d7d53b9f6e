//! Priority-based preemption.
//!
//! When no node fits a pod with positive priority, look for a node where
//! evicting strictly lower-priority pods would make it fit. The search is
//! per node: remove every lower-priority pod, check the pod fits, then put
//! victims back from the highest priority down while it still fits. Among
//! viable nodes the cheapest victim set wins.

use std::cmp::Ordering;
use std::sync::Arc;

use keel_api::{Pod, Resource};

use super::filters::{run_filters, FilterFn};
use super::framework::Snapshot;

/// A node and the pods that must leave it.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub node: String,
    pub victims: Vec<Arc<Pod>>,
}

/// Cost of a victim set, compared lexicographically: the highest evicted
/// priority first, then the sum of priorities, then the count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VictimCost {
    pub max_priority: i32,
    pub priority_sum: i64,
    pub count: usize,
}

impl VictimCost {
    pub fn of(victims: &[Arc<Pod>]) -> Self {
        Self {
            max_priority: victims
                .iter()
                .map(|v| v.spec.priority)
                .max()
                .unwrap_or(i32::MIN),
            priority_sum: victims.iter().map(|v| i64::from(v.spec.priority)).sum(),
            count: victims.len(),
        }
    }
}

/// Whether `pod` may evict others now.
///
/// A pod whose nominated node still has lower-priority pods terminating
/// waits for them instead of choosing more victims.
pub fn eligible_to_preempt(pod: &Pod, snapshot: &Snapshot) -> bool {
    if pod.spec.priority <= 0 {
        return false;
    }
    let Some(node) = pod
        .status
        .nominated_node_name
        .as_deref()
        .and_then(|n| snapshot.get(n))
    else {
        return true;
    };
    !node
        .pods()
        .iter()
        .any(|p| p.metadata.is_deleting() && p.spec.priority < pod.spec.priority)
}

/// Minimal victims on `node_name` that let `pod` fit, if any set does.
pub fn select_victims(
    pod: &Pod,
    node_name: &str,
    snapshot: &Snapshot,
    filters: &[(&str, FilterFn)],
) -> Option<Vec<Arc<Pod>>> {
    let node = snapshot.get(node_name)?;
    let mut potential: Vec<Arc<Pod>> = node
        .pods()
        .iter()
        .filter(|p| {
            p.is_bound() && !p.metadata.is_deleting() && p.spec.priority < pod.spec.priority
        })
        .cloned()
        .collect();
    if potential.is_empty() {
        return None;
    }

    let mut sim = snapshot.clone();
    let sim_node = sim.get_mut(node_name)?;
    for victim in &potential {
        sim_node.remove_pod(&victim.key());
    }
    run_filters(filters, pod, sim.get(node_name)?, &sim).ok()?;

    // Reprieve the most important pods first.
    potential.sort_by(|a, b| {
        b.spec
            .priority
            .cmp(&a.spec.priority)
            .then_with(|| a.metadata.name.cmp(&b.metadata.name))
    });
    let mut victims = Vec::new();
    for candidate in potential {
        sim.get_mut(node_name)?.add_pod(candidate.clone());
        if run_filters(filters, pod, sim.get(node_name)?, &sim).is_err() {
            sim.get_mut(node_name)?.remove_pod(&candidate.key());
            victims.push(candidate);
        }
    }
    Some(victims)
}

/// Cheapest preemption across all nodes, ties broken by node name.
pub fn find_candidate(
    pod: &Pod,
    snapshot: &Snapshot,
    filters: &[(&str, FilterFn)],
) -> Option<Candidate> {
    snapshot
        .nodes()
        .iter()
        .filter_map(|node| {
            select_victims(pod, node.name(), snapshot, filters).map(|victims| Candidate {
                node: node.name().to_string(),
                victims,
            })
        })
        .min_by(|a, b| compare(a, b))
}

fn compare(a: &Candidate, b: &Candidate) -> Ordering {
    VictimCost::of(&a.victims)
        .cmp(&VictimCost::of(&b.victims))
        .then_with(|| a.node.cmp(&b.node))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::filters::DEFAULT_FILTERS;
    use chrono::Utc;
    use keel_testing::{NodeBuilder, PodBuilder};

    fn snapshot(nodes: Vec<keel_api::Node>, pods: Vec<Pod>, incoming: &Pod) -> Snapshot {
        let nodes: Vec<_> = nodes.into_iter().map(Arc::new).collect();
        let pods: Vec<_> = pods.into_iter().map(Arc::new).collect();
        Snapshot::build(&nodes, &pods, &[], incoming)
    }

    fn names(victims: &[Arc<Pod>]) -> Vec<&str> {
        victims.iter().map(|v| v.metadata.name.as_str()).collect()
    }

    #[test]
    fn test_evicts_lower_priority_pod() {
        let pending = PodBuilder::new("default", "w2").cpu_millis(4000).priority(100).build();
        let running = PodBuilder::new("default", "w1")
            .cpu_millis(4000)
            .priority(10)
            .bound_to("a")
            .build();
        let snap = snapshot(vec![NodeBuilder::new("a").build()], vec![running], &pending);

        let candidate = find_candidate(&pending, &snap, DEFAULT_FILTERS).unwrap();
        assert_eq!(candidate.node, "a");
        assert_eq!(names(&candidate.victims), vec!["w1"]);
    }

    #[test]
    fn test_never_evicts_equal_or_higher_priority() {
        let pending = PodBuilder::new("default", "p").cpu_millis(4000).priority(100).build();
        let equal = PodBuilder::new("default", "eq")
            .cpu_millis(4000)
            .priority(100)
            .bound_to("a")
            .build();
        let snap = snapshot(vec![NodeBuilder::new("a").build()], vec![equal], &pending);
        assert!(find_candidate(&pending, &snap, DEFAULT_FILTERS).is_none());
    }

    #[test]
    fn test_reprieves_pods_not_needed() {
        // 4000m node holding 1000m@5, 1000m@1 and 2000m@50; a 2000m pod only
        // needs the two small ones gone.
        let pending = PodBuilder::new("default", "p").cpu_millis(2000).priority(100).build();
        let pods = vec![
            PodBuilder::new("default", "small-a").cpu_millis(1000).priority(5).bound_to("a").build(),
            PodBuilder::new("default", "small-b").cpu_millis(1000).priority(1).bound_to("a").build(),
            PodBuilder::new("default", "big").cpu_millis(2000).priority(50).bound_to("a").build(),
        ];
        let snap = snapshot(vec![NodeBuilder::new("a").build()], pods, &pending);

        let victims = select_victims(&pending, "a", &snap, DEFAULT_FILTERS).unwrap();
        let mut got = names(&victims);
        got.sort();
        assert_eq!(got, vec!["small-a", "small-b"]);
    }

    #[test]
    fn test_prefers_node_with_lowest_victim_priority() {
        let pending = PodBuilder::new("default", "p").cpu_millis(4000).priority(100).build();
        let pods = vec![
            PodBuilder::new("default", "on-a").cpu_millis(4000).priority(20).bound_to("a").build(),
            PodBuilder::new("default", "on-b").cpu_millis(4000).priority(10).bound_to("b").build(),
        ];
        let snap = snapshot(
            vec![NodeBuilder::new("a").build(), NodeBuilder::new("b").build()],
            pods,
            &pending,
        );
        let candidate = find_candidate(&pending, &snap, DEFAULT_FILTERS).unwrap();
        assert_eq!(candidate.node, "b");
    }

    #[test]
    fn test_unresolvable_filters_block_preemption() {
        let pending = PodBuilder::new("default", "p").cpu_millis(4000).priority(100).build();
        let victim = PodBuilder::new("default", "v").cpu_millis(4000).priority(1).bound_to("a").build();
        let node = NodeBuilder::new("a")
            .taint("dedicated", "db", keel_api::TaintEffect::NoSchedule)
            .build();
        let snap = snapshot(vec![node], vec![victim], &pending);
        assert!(find_candidate(&pending, &snap, DEFAULT_FILTERS).is_none());
    }

    #[test]
    fn test_waits_for_terminating_victims_on_nominated_node() {
        let mut pending = PodBuilder::new("default", "p").priority(100).build();
        pending.status.nominated_node_name = Some("a".to_string());
        let mut leaving = PodBuilder::new("default", "v").priority(1).bound_to("a").build();
        leaving.metadata.deletion_timestamp = Some(Utc::now());
        let snap = snapshot(vec![NodeBuilder::new("a").build()], vec![leaving], &pending);

        assert!(!eligible_to_preempt(&pending, &snap));
        let zero = PodBuilder::new("default", "z").build();
        assert!(!eligible_to_preempt(&zero, &snap));
    }

    #[test]
    fn test_victim_cost_order() {
        let pod = |p| Arc::new(PodBuilder::new("default", "x").priority(p).build());
        let one_high = VictimCost::of(&[pod(50)]);
        let two_low = VictimCost::of(&[pod(10), pod(10)]);
        assert!(two_low < one_high);
    }
}
