//! Built-in controllers run by the leader alongside the scheduler.

pub mod garbage_collector;
pub mod node_lifecycle;
pub mod replica_set;

pub use garbage_collector::{GarbageCollector, GcHandler};
pub use node_lifecycle::{NodeLifecycleConfig, NodeLifecycleController};
pub use replica_set::ReplicaSetController;
