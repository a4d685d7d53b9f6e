//! Wiring of informers, controllers and leader election.
//!
//! Informers run on every replica so a standby has warm caches. Controllers
//! only run while this replica leads. Losing the lease stops them and ends
//! [`ControlPlane::run`] with [`LeaderError::Lost`], which the binary treats
//! as fatal.

use std::sync::Arc;

use keel_api::{Node, Pod, ReplicaSet};
use keel_reconcile::{Controller, ControllerConfig, EnqueueHandler, EventHandler, Informer, InformerStore};
use keel_store::{Api, ObjectStore, WatcherConfig};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, instrument};

use crate::controllers::{
    replica_set, GarbageCollector, GcHandler, NodeLifecycleConfig, NodeLifecycleController,
    ReplicaSetController,
};
use crate::leader::{LeaderElector, LeaderError, LeaderState};
use crate::scheduler::{Scheduler, SchedulerConfig, SchedulingHandler};

#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
    /// Prefix of the actor recorded on every write.
    pub identity: String,
    pub controller: ControllerConfig,
    pub scheduler: SchedulerConfig,
    pub node_lifecycle: NodeLifecycleConfig,
    pub watcher: WatcherConfig,
}

impl ControlPlaneConfig {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            controller: ControllerConfig::default(),
            scheduler: SchedulerConfig::default(),
            node_lifecycle: NodeLifecycleConfig::default(),
            watcher: WatcherConfig::default(),
        }
    }
}

/// Informer caches, for readiness reporting.
#[derive(Clone)]
pub struct Caches {
    pub pods: InformerStore<Pod>,
    pub nodes: InformerStore<Node>,
    pub replica_sets: InformerStore<ReplicaSet>,
}

impl Caches {
    async fn wait_synced(&self) {
        self.pods.wait_synced().await;
        self.nodes.wait_synced().await;
        self.replica_sets.wait_synced().await;
    }
}

pub struct ControlPlane {
    pod_informer: Informer<Pod>,
    node_informer: Informer<Node>,
    rs_informer: Informer<ReplicaSet>,
    caches: Caches,
    scheduler: Controller<Scheduler>,
    replica_sets: Controller<ReplicaSetController>,
    garbage_collector: Controller<GarbageCollector>,
    node_lifecycle: Controller<NodeLifecycleController>,
}

impl ControlPlane {
    pub fn new(store: Arc<dyn ObjectStore>, config: ControlPlaneConfig) -> Self {
        let actor = |component: &str| format!("{}/{component}", config.identity);
        let pods_api = Api::<Pod>::all(store.clone());
        let nodes_api = Api::<Node>::cluster(store.clone());
        let rs_api = Api::<ReplicaSet>::all(store);

        let mut pod_informer = Informer::new(pods_api.clone(), config.watcher.clone());
        let mut node_informer = Informer::new(nodes_api.clone(), config.watcher.clone());
        let mut rs_informer = Informer::new(rs_api.clone(), config.watcher.clone());
        let caches = Caches {
            pods: pod_informer.store(),
            nodes: node_informer.store(),
            replica_sets: rs_informer.store(),
        };

        // One pending pod per cycle.
        let scheduler_config = ControllerConfig {
            workers: 1,
            ..config.controller.clone()
        };
        let mut scheduler = Controller::new(
            Arc::new(Scheduler::new(
                caches.pods.clone(),
                caches.nodes.clone(),
                pods_api.clone().with_actor(actor("scheduler")),
                config.scheduler.clone(),
            )),
            scheduler_config,
        );
        scheduler.resync_from(caches.pods.clone());

        let mut replica_sets = Controller::new(
            Arc::new(ReplicaSetController::new(
                caches.replica_sets.clone(),
                caches.pods.clone(),
                rs_api.clone().with_actor(actor("replica-set-controller")),
                pods_api.clone().with_actor(actor("replica-set-controller")),
            )),
            config.controller.clone(),
        );
        replica_sets.resync_from(caches.replica_sets.clone());

        let mut garbage_collector = Controller::new(
            Arc::new(GarbageCollector::new(
                caches.pods.clone(),
                caches.replica_sets.clone(),
                pods_api.clone().with_actor(actor("garbage-collector")),
                rs_api.with_actor(actor("garbage-collector")),
            )),
            config.controller.clone(),
        );
        garbage_collector.resync_from(caches.pods.clone());
        garbage_collector.resync_from(caches.replica_sets.clone());

        let mut node_lifecycle = Controller::new(
            Arc::new(NodeLifecycleController::new(
                caches.nodes.clone(),
                caches.pods.clone(),
                nodes_api.with_actor(actor("node-lifecycle-controller")),
                pods_api.with_actor(actor("node-lifecycle-controller")),
                config.node_lifecycle.clone(),
            )),
            config.controller.clone(),
        );
        node_lifecycle.resync_from(caches.nodes.clone());

        let scheduling = SchedulingHandler::new(scheduler.queue(), caches.pods.clone());
        let gc = GcHandler::new(garbage_collector.queue(), caches.pods.clone());

        pod_informer.add_event_handler(scheduling.clone() as Arc<dyn EventHandler<Pod>>);
        pod_informer.add_event_handler(EnqueueHandler::<Pod>::mapped(
            replica_sets.queue(),
            replica_set::owner_key,
        ));
        pod_informer.add_event_handler(gc.clone() as Arc<dyn EventHandler<Pod>>);

        node_informer.add_event_handler(scheduling as Arc<dyn EventHandler<Node>>);
        node_informer.add_event_handler(EnqueueHandler::<Node>::for_self(node_lifecycle.queue()));

        rs_informer.add_event_handler(EnqueueHandler::<ReplicaSet>::for_self(replica_sets.queue()));
        rs_informer.add_event_handler(gc as Arc<dyn EventHandler<ReplicaSet>>);

        Self {
            pod_informer,
            node_informer,
            rs_informer,
            caches,
            scheduler,
            replica_sets,
            garbage_collector,
            node_lifecycle,
        }
    }

    pub fn caches(&self) -> Caches {
        self.caches.clone()
    }

    /// Run until shutdown or until leadership is lost.
    ///
    /// Controllers are stopped and drained before the lease is released, so
    /// no write from this replica can land after another replica takes over
    /// through a release.
    #[instrument(skip_all, fields(identity = %elector.identity()))]
    pub async fn run(
        self,
        elector: Arc<LeaderElector>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), LeaderError> {
        let (informer_stop_tx, informer_stop_rx) = watch::channel(false);
        let mut informers = JoinSet::new();
        informers.spawn(self.pod_informer.run(informer_stop_rx.clone()));
        informers.spawn(self.node_informer.run(informer_stop_rx.clone()));
        informers.spawn(self.rs_informer.run(informer_stop_rx));

        let (election_stop_tx, election_stop_rx) = watch::channel(false);
        let election = tokio::spawn({
            let elector = elector.clone();
            async move { elector.run(election_stop_rx).await }
        });
        let mut leadership = elector.subscribe();

        let acquired = tokio::select! {
            res = leadership.wait_for(|s| *s == LeaderState::Leader) => res.is_ok(),
            _ = shutdown_requested(&mut shutdown) => false,
        };

        if acquired {
            let synced = tokio::select! {
                _ = self.caches.wait_synced() => true,
                _ = shutdown_requested(&mut shutdown) => false,
                _ = leadership.wait_for(|s| *s != LeaderState::Leader) => false,
            };

            if synced {
                let (controller_stop_tx, controller_stop_rx) = watch::channel(false);
                let mut controllers = JoinSet::new();
                controllers.spawn(self.scheduler.run(controller_stop_rx.clone()));
                controllers.spawn(self.replica_sets.run(controller_stop_rx.clone()));
                controllers.spawn(self.garbage_collector.run(controller_stop_rx.clone()));
                controllers.spawn(self.node_lifecycle.run(controller_stop_rx));
                info!("Leading; controllers started");

                let lost = tokio::select! {
                    _ = leadership.wait_for(|s| *s != LeaderState::Leader) => true,
                    _ = shutdown_requested(&mut shutdown) => false,
                };

                controller_stop_tx.send_replace(true);
                while controllers.join_next().await.is_some() {}
                info!(lost, "Controllers stopped");
            }
        }

        election_stop_tx.send_replace(true);
        let outcome = match election.await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Leader election task failed");
                Err(LeaderError::Lost(format!("election task failed: {e}")))
            }
        };

        informer_stop_tx.send_replace(true);
        while informers.join_next().await.is_some() {}
        outcome
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender counts as shutdown.
    let _ = shutdown.wait_for(|stop| *stop).await;
}
