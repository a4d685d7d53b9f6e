//! Test fixtures for keel.
//!
//! Builders produce valid objects with terse call sites. [`PartitionedStore`]
//! cuts one replica off from the store, refuses single verbs, or holds back
//! replies to writes that already committed. [`wait_until`] polls a
//! condition under real or paused time.

mod builders;
mod partition;

pub use builders::{NodeBuilder, PodBuilder, ReplicaSetBuilder};
pub use partition::{PartitionedStore, Verb};

use std::future::Future;
use std::time::Duration;

/// Poll `condition` every `step` until it holds or `timeout` elapses.
/// Returns whether it held.
pub async fn wait_until<F, Fut>(timeout: Duration, step: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(step).await;
    }
}
