//! Soft placement preferences.
//!
//! Every scorer yields a raw value per feasible node; its [`Normalize`]
//! mode maps the raw values onto 0..=100 across the candidate set before
//! the weighted sum.

use keel_api::{Pod, TaintEffect, WeightedPodAffinityTerm};
use rand::seq::IndexedRandom;
use rand::Rng;

use super::framework::{NodeInfo, Snapshot};

pub const MAX_NODE_SCORE: i64 = 100;

pub type ScoreFn = fn(&Pod, &NodeInfo, &Snapshot) -> i64;

/// How raw scores become 0..=100.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Normalize {
    /// Raw score already lies in 0..=100.
    None,
    /// Scale so the highest raw score maps to 100.
    Max,
    /// Scale so the highest raw score maps to 0 and zero maps to 100.
    ReverseMax,
    /// Map the lowest raw score to 0 and the highest to 100.
    MinMax,
}

/// Relative weight of each scorer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoringWeights {
    pub least_allocated: i64,
    pub balanced_allocation: i64,
    pub node_affinity: i64,
    pub inter_pod_affinity: i64,
    pub taint_toleration: i64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            least_allocated: 1,
            balanced_allocation: 1,
            node_affinity: 2,
            inter_pod_affinity: 2,
            taint_toleration: 3,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ScorePlugin {
    pub name: &'static str,
    pub weight: i64,
    pub score: ScoreFn,
    pub normalize: Normalize,
}

impl ScoringWeights {
    /// Active scorers. A zero weight disables one.
    pub fn plugins(&self) -> Vec<ScorePlugin> {
        [
            ScorePlugin {
                name: "LeastAllocated",
                weight: self.least_allocated,
                score: least_allocated,
                normalize: Normalize::None,
            },
            ScorePlugin {
                name: "BalancedAllocation",
                weight: self.balanced_allocation,
                score: balanced_allocation,
                normalize: Normalize::None,
            },
            ScorePlugin {
                name: "NodeAffinity",
                weight: self.node_affinity,
                score: preferred_node_affinity,
                normalize: Normalize::Max,
            },
            ScorePlugin {
                name: "InterPodAffinity",
                weight: self.inter_pod_affinity,
                score: preferred_inter_pod_affinity,
                normalize: Normalize::MinMax,
            },
            ScorePlugin {
                name: "TaintToleration",
                weight: self.taint_toleration,
                score: intolerable_prefer_no_schedule,
                normalize: Normalize::ReverseMax,
            },
        ]
        .into_iter()
        .filter(|p| p.weight > 0)
        .collect()
    }
}

/// Usage fractions (cpu, memory) on `node` once `pod` is added, in 0..=1.
fn fractions_after(pod: &Pod, node: &NodeInfo) -> (f64, f64) {
    let alloc = node.allocatable();
    let used = node.requested().add(&pod.total_requests());
    let frac = |used: u64, total: u64| {
        if total == 0 {
            1.0
        } else {
            (used as f64 / total as f64).min(1.0)
        }
    };
    (
        frac(used.cpu_millis, alloc.cpu_millis),
        frac(used.memory_bytes, alloc.memory_bytes),
    )
}

/// Favors nodes with the most free cpu and memory left after placement.
pub fn least_allocated(pod: &Pod, node: &NodeInfo, _snapshot: &Snapshot) -> i64 {
    let (cpu, mem) = fractions_after(pod, node);
    let free = ((1.0 - cpu) + (1.0 - mem)) / 2.0;
    (free * MAX_NODE_SCORE as f64).round() as i64
}

/// Penalizes skew between cpu and memory utilization.
pub fn balanced_allocation(pod: &Pod, node: &NodeInfo, _snapshot: &Snapshot) -> i64 {
    let (cpu, mem) = fractions_after(pod, node);
    ((1.0 - (cpu - mem).abs()) * MAX_NODE_SCORE as f64).round() as i64
}

/// Sum of weights of matching preferred node-affinity terms.
pub fn preferred_node_affinity(pod: &Pod, node: &NodeInfo, _snapshot: &Snapshot) -> i64 {
    let labels = &node.node().metadata.labels;
    pod.spec
        .affinity
        .as_ref()
        .and_then(|a| a.node_affinity.as_ref())
        .map(|na| {
            na.preferred
                .iter()
                .filter(|t| t.preference.matches(labels))
                .map(|t| i64::from(t.weight))
                .sum()
        })
        .unwrap_or(0)
}

/// Weight of preferred affinity terms satisfied in the node's domain, minus
/// the weight of preferred anti-affinity terms violated there.
pub fn preferred_inter_pod_affinity(pod: &Pod, node: &NodeInfo, snapshot: &Snapshot) -> i64 {
    let Some(affinity) = pod.spec.affinity.as_ref() else {
        return 0;
    };
    let ns = pod.metadata.namespace.as_str();
    let count = |terms: &[WeightedPodAffinityTerm]| -> i64 {
        terms
            .iter()
            .map(|wt| {
                let Some(domain) = node.topology_value(&wt.term.topology_key) else {
                    return 0;
                };
                let matches = snapshot
                    .nodes()
                    .iter()
                    .filter(|n| n.topology_value(&wt.term.topology_key) == Some(domain))
                    .flat_map(|n| n.pods().iter())
                    .filter(|p| wt.term.selects(ns, p))
                    .count() as i64;
                matches * i64::from(wt.weight)
            })
            .sum()
    };
    let attract = affinity
        .pod_affinity
        .as_ref()
        .map(|a| count(&a.preferred))
        .unwrap_or(0);
    let repel = affinity
        .pod_anti_affinity
        .as_ref()
        .map(|a| count(&a.preferred))
        .unwrap_or(0);
    attract - repel
}

/// Count of `PreferNoSchedule` taints the pod does not tolerate.
pub fn intolerable_prefer_no_schedule(pod: &Pod, node: &NodeInfo, _snapshot: &Snapshot) -> i64 {
    node.node()
        .spec
        .taints
        .iter()
        .filter(|t| t.effect == TaintEffect::PreferNoSchedule && !pod.tolerates(t))
        .count() as i64
}

/// Map raw scores onto 0..=100 in place.
pub fn normalize(mode: Normalize, scores: &mut [i64]) {
    let (Some(&min), Some(&max)) = (scores.iter().min(), scores.iter().max()) else {
        return;
    };
    match mode {
        Normalize::None => {
            for s in scores.iter_mut() {
                *s = (*s).clamp(0, MAX_NODE_SCORE);
            }
        }
        Normalize::Max => {
            for s in scores.iter_mut() {
                *s = if max <= 0 { 0 } else { (*s).max(0) * MAX_NODE_SCORE / max };
            }
        }
        Normalize::ReverseMax => {
            for s in scores.iter_mut() {
                *s = if max <= 0 {
                    MAX_NODE_SCORE
                } else {
                    MAX_NODE_SCORE - (*s).max(0) * MAX_NODE_SCORE / max
                };
            }
        }
        Normalize::MinMax => {
            let range = max - min;
            for s in scores.iter_mut() {
                *s = if range == 0 { 0 } else { (*s - min) * MAX_NODE_SCORE / range };
            }
        }
    }
}

/// Weighted total per candidate, in candidate order.
pub fn score_nodes(
    plugins: &[ScorePlugin],
    pod: &Pod,
    candidates: &[&NodeInfo],
    snapshot: &Snapshot,
) -> Vec<i64> {
    let mut totals = vec![0i64; candidates.len()];
    for plugin in plugins {
        let mut raw: Vec<i64> = candidates
            .iter()
            .map(|node| (plugin.score)(pod, node, snapshot))
            .collect();
        normalize(plugin.normalize, &mut raw);
        for (total, score) in totals.iter_mut().zip(raw) {
            *total += score * plugin.weight;
        }
    }
    totals
}

/// Index of the highest total, chosen uniformly at random among ties.
pub fn select_host<R: Rng + ?Sized>(totals: &[i64], rng: &mut R) -> Option<usize> {
    let max = *totals.iter().max()?;
    let tied: Vec<usize> = totals
        .iter()
        .enumerate()
        .filter(|(_, s)| **s == max)
        .map(|(i, _)| i)
        .collect();
    tied.choose(rng).copied()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use super::*;
    use keel_testing::{NodeBuilder, PodBuilder};
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rstest::rstest;

    const GIB: u64 = 1024 * 1024 * 1024;

    #[rstest]
    #[case(Normalize::Max, vec![0, 5, 10], vec![0, 50, 100])]
    #[case(Normalize::Max, vec![0, 0], vec![0, 0])]
    #[case(Normalize::ReverseMax, vec![0, 1, 2], vec![100, 50, 0])]
    #[case(Normalize::ReverseMax, vec![0, 0], vec![100, 100])]
    #[case(Normalize::MinMax, vec![-4, 0, 4], vec![0, 50, 100])]
    #[case(Normalize::None, vec![-3, 50, 130], vec![0, 50, 100])]
    fn test_normalize(#[case] mode: Normalize, #[case] mut raw: Vec<i64>, #[case] want: Vec<i64>) {
        normalize(mode, &mut raw);
        assert_eq!(raw, want);
    }

    #[test]
    fn test_least_allocated_prefers_emptier_node() {
        let pod = PodBuilder::new("default", "p").cpu_millis(1000).memory_bytes(GIB).build();
        let nodes = vec![
            Arc::new(NodeBuilder::new("busy").build()),
            Arc::new(NodeBuilder::new("idle").build()),
        ];
        let busy = Arc::new(
            PodBuilder::new("default", "x")
                .cpu_millis(2000)
                .memory_bytes(4 * GIB)
                .bound_to("busy")
                .build(),
        );
        let snap = Snapshot::build(&nodes, &[busy], &[], &pod);
        let a = least_allocated(&pod, snap.get("busy").unwrap(), &snap);
        let b = least_allocated(&pod, snap.get("idle").unwrap(), &snap);
        assert!(b > a, "idle={b} busy={a}");
    }

    #[test]
    fn test_balanced_allocation_penalizes_skew() {
        // 4 CPU / 8 GiB nodes: 2 CPU + 4 GiB is balanced, 2 CPU + 0 is not.
        let balanced = PodBuilder::new("default", "b").cpu_millis(2000).memory_bytes(4 * GIB).build();
        let skewed = PodBuilder::new("default", "s").cpu_millis(2000).build();
        let nodes = vec![Arc::new(NodeBuilder::new("a").build())];
        let snap = Snapshot::build(&nodes, &[], &[], &balanced);
        let node = snap.get("a").unwrap();
        assert_eq!(balanced_allocation(&balanced, node, &snap), 100);
        assert_eq!(balanced_allocation(&skewed, node, &snap), 50);
    }

    #[test]
    fn test_prefer_no_schedule_lowers_total() {
        let pod = PodBuilder::new("default", "p").build();
        let nodes = vec![
            Arc::new(NodeBuilder::new("a").taint("spot", "", TaintEffect::PreferNoSchedule).build()),
            Arc::new(NodeBuilder::new("b").build()),
        ];
        let snap = Snapshot::build(&nodes, &[], &[], &pod);
        let candidates: Vec<&NodeInfo> = snap.nodes().iter().collect();
        let totals = score_nodes(&ScoringWeights::default().plugins(), &pod, &candidates, &snap);
        assert!(totals[1] > totals[0], "{totals:?}");
    }

    #[test]
    fn test_zero_weight_disables_plugin() {
        let weights = ScoringWeights {
            taint_toleration: 0,
            ..Default::default()
        };
        assert!(weights.plugins().iter().all(|p| p.name != "TaintToleration"));
    }

    #[test]
    fn test_select_host_picks_every_tied_node() {
        let totals = [300, 500, 200, 500, 500];
        let mut rng = StdRng::seed_from_u64(7);
        let mut picked = BTreeSet::new();
        for _ in 0..200 {
            picked.insert(select_host(&totals, &mut rng).unwrap());
        }
        assert_eq!(picked, BTreeSet::from([1, 3, 4]));
    }

    #[test]
    fn test_select_host_is_reproducible_with_seed() {
        let totals = [1, 1, 1, 1];
        let run = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..16)
                .map(|_| select_host(&totals, &mut rng).unwrap())
                .collect::<Vec<_>>()
        };
        assert_eq!(run(42), run(42));
    }

    #[test]
    fn test_select_host_empty() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(select_host(&[], &mut rng), None);
    }

    proptest! {
        #[test]
        fn prop_selected_host_has_max_score(totals in prop::collection::vec(0i64..1000, 1..32), seed in any::<u64>()) {
            let mut rng = StdRng::seed_from_u64(seed);
            let idx = select_host(&totals, &mut rng).unwrap();
            prop_assert_eq!(totals[idx], *totals.iter().max().unwrap());
        }
    }
}
