//! Reconciliation loop primitives.
//!
//! This library turns change notifications into idempotent corrective
//! action. Key concepts:
//!
//! - **Desired state**: what the object's `spec` says.
//! - **Observed state**: what `status` and dependent objects say.
//! - **Reconciliation**: closing the gap, computed from current state only.
//!
//! # Pieces
//!
//! - [`Informer`]: relist-then-watch cache with lock-free reads
//! - [`WorkQueue`]: deduplicating queue, at most one in-flight run per key
//! - [`Controller`]: worker pool with backoff, resync and a poison policy
//! - [`SpecHash`], [`RetryTracker`], [`select_for_drain`]: helpers used by
//!   controllers
//!
//! # Invariants
//!
//! - All reconciles are idempotent
//! - A key is never reconciled by two workers at the same time
//! - Cache entries only move forward in `resourceVersion`

mod controller;
mod drain;
mod error;
mod hash;
mod informer;
mod queue;
mod retry;

pub use controller::{Action, Controller, ControllerConfig, EnqueueHandler, Reconciler};
pub use drain::{select_for_drain, DrainPriority};
pub use error::ReconcileError;
pub use hash::SpecHash;
pub use informer::{EventHandler, Informer, InformerStore};
pub use keel_store::BackoffPolicy;
pub use queue::WorkQueue;
pub use retry::{RetryTracker, RetryVerdict};
