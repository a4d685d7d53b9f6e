//! Pod scheduler.
//!
//! The scheduler is responsible for:
//! - Filtering nodes on hard constraints (resources, taints, affinity, ports)
//! - Scoring feasible nodes and breaking ties at random
//! - Binding the pod through an optimistic-concurrency update
//! - Preempting lower-priority pods when nothing fits
//!
//! Each phase is a list of plain functions over a [`Snapshot`], so single
//! predicates and scorers are tested in isolation.

pub mod filters;
pub mod framework;
pub mod preemption;
mod reconciler;
pub mod scoring;

use std::collections::BTreeMap;
use std::fmt;

use keel_reconcile::ReconcileError;
use keel_store::StoreError;

pub use framework::{NodeInfo, Snapshot};
pub use reconciler::{Scheduler, SchedulerConfig, SchedulingHandler};
pub use scoring::ScoringWeights;

/// Result type for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors that can occur during scheduling.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// No node passes every filter. Expected under pressure, never fatal.
    #[error(transparent)]
    Infeasible(#[from] FitError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl From<SchedulerError> for ReconcileError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::Store(e) => ReconcileError::Store(e),
            SchedulerError::Infeasible(e) => ReconcileError::Internal(e.to_string()),
        }
    }
}

/// Why each node rejected a pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FitError {
    pub num_nodes: usize,
    /// Node name to the first failing filter's reason.
    pub reasons: BTreeMap<String, String>,
}

impl fmt::Display for FitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0/{} nodes are available", self.num_nodes)?;
        if self.reasons.is_empty() {
            return write!(f, ": no nodes registered");
        }
        let mut sep = ": ";
        for (node, reason) in &self.reasons {
            write!(f, "{sep}{node}: {reason}")?;
            sep = "; ";
        }
        Ok(())
    }
}

impl std::error::Error for FitError {}
