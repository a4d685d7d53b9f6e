//! A single control-plane replica over an in-memory store.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use keel_api::{Lease, Node, Pod, ReplicaSet};
use keel_control_plane::leader::{LeaderElectionConfig, LeaderElector, LeaderError};
use keel_control_plane::manager::{ControlPlane, ControlPlaneConfig};
use keel_control_plane::scheduler::SchedulerConfig;
use keel_reconcile::{BackoffPolicy, ControllerConfig};
use keel_store::{Api, MemoryStore, ObjectStore, WatcherConfig};
use keel_testing::{wait_until, PartitionedStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const IDENTITY: &str = "replica-0";

pub struct Cluster {
    pub memory: MemoryStore,
    pub store: Arc<dyn ObjectStore>,
    /// The control plane's own view of the store, for injecting faults.
    pub link: PartitionedStore,
    pub pods: Api<Pod>,
    pub nodes: Api<Node>,
    pub replica_sets: Api<ReplicaSet>,
    pub elector: Arc<LeaderElector>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<Result<(), LeaderError>>,
}

/// `test_config` with a retry budget small enough to exhaust quickly.
pub fn giving_up_config() -> ControlPlaneConfig {
    let mut config = test_config();
    config.controller.max_retries = Some(2);
    config
}

/// Fast timings so tests settle in milliseconds.
pub fn test_config() -> ControlPlaneConfig {
    let mut config = ControlPlaneConfig::new(IDENTITY);
    config.controller = ControllerConfig {
        workers: 2,
        resync_period: Duration::from_secs(1),
        backoff: BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(500)),
        max_retries: None,
    };
    config.scheduler = SchedulerConfig {
        unschedulable_retry: Duration::from_millis(50),
        seed: Some(7),
        ..Default::default()
    };
    config.node_lifecycle.monitor_period = Duration::from_millis(100);
    config.watcher = WatcherConfig {
        idle_timeout: Duration::from_secs(30),
        backoff: BackoffPolicy::new(Duration::from_millis(5), Duration::from_millis(50)),
    };
    config
}

impl Cluster {
    pub async fn start() -> Self {
        Self::start_with(test_config()).await
    }

    /// Start one replica and wait until it leads.
    pub async fn start_with(config: ControlPlaneConfig) -> Self {
        let memory = MemoryStore::default();
        let store: Arc<dyn ObjectStore> = Arc::new(memory.clone());
        let link = PartitionedStore::new(store.clone());
        let replica: Arc<dyn ObjectStore> = Arc::new(link.clone());
        let elector = Arc::new(
            LeaderElector::new(
                Api::<Lease>::all(replica.clone()),
                LeaderElectionConfig::new(IDENTITY),
            )
            .unwrap(),
        );

        let control_plane = ControlPlane::new(replica, config);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(control_plane.run(elector.clone(), shutdown_rx));

        eventually("leadership", || async { elector.is_leader() }).await;

        Self {
            memory,
            pods: Api::all(store.clone()).with_actor("tests"),
            nodes: Api::cluster(store.clone()).with_actor("tests"),
            replica_sets: Api::all(store.clone()).with_actor("tests"),
            store,
            link,
            elector,
            shutdown,
            handle,
        }
    }

    pub async fn stop(self) {
        self.shutdown.send_replace(true);
        self.handle.await.unwrap().unwrap();
    }

    pub async fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.pods.within(namespace).get_opt(name).await.unwrap()
    }

    pub async fn node(&self, name: &str) -> Option<Node> {
        self.nodes.get_opt(name).await.unwrap()
    }

    pub async fn replica_set(&self, namespace: &str, name: &str) -> Option<ReplicaSet> {
        self.replica_sets.within(namespace).get_opt(name).await.unwrap()
    }

    pub async fn list_pods(&self) -> Vec<Pod> {
        self.pods.list(None).await.unwrap().items
    }
}

/// Wait up to ten seconds for `condition`, panicking with `what` otherwise.
pub async fn eventually<F, Fut>(what: &str, condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    assert!(
        wait_until(Duration::from_secs(10), Duration::from_millis(10), condition).await,
        "timed out waiting for {what}"
    );
}
