//! keel control plane
//!
//! Runs the scheduler and built-in controllers against the object store
//! while holding the leader lease, and serves health checks.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use keel_api::Lease;
use keel_control_plane::{
    api,
    config::Config,
    leader::LeaderElector,
    manager::{ControlPlane, ControlPlaneConfig},
    state::AppState,
};
use keel_store::{Api, MemoryStore, ObjectStore, WatcherConfig};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to KEEL_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let identity = config.leader_election.identity.clone();
    info!(%identity, "Starting keel control plane");
    info!(listen_addr = %config.listen_addr, "Configuration loaded");

    // Embedded store; replicas in one process share it.
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::default());

    let elector = Arc::new(LeaderElector::new(
        Api::<Lease>::all(store.clone()),
        config.leader_election.clone(),
    )?);

    let control_plane = ControlPlane::new(
        store,
        ControlPlaneConfig {
            identity: identity.clone(),
            controller: config.controller.clone(),
            scheduler: config.scheduler.clone(),
            node_lifecycle: config.node_lifecycle.clone(),
            watcher: WatcherConfig::default(),
        },
    );
    let caches = control_plane.caches();

    let state = AppState::builder(identity, elector.subscribe())
        .cache(caches.pods)
        .cache(caches.nodes)
        .cache(caches.replica_sets)
        .build();

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut control_plane_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { control_plane.run(elector, shutdown_rx).await }
    });

    let app = api::create_router(state);
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                let _ = shutdown_rx.wait_for(|stop| *stop).await;
                info!("HTTP server shutting down");
            })
            .await
    });

    // Wait for Ctrl+C, or for the control plane to stop on its own.
    let early_exit = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            None
        }
        result = &mut control_plane_handle => Some(result),
    };

    let _ = shutdown_tx.send(true);

    let shutdown_timeout = Duration::from_secs(10);
    let outcome = match early_exit {
        Some(result) => result,
        None => match tokio::time::timeout(shutdown_timeout, control_plane_handle).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Control plane did not shut down in time");
                Ok(Ok(()))
            }
        },
    };

    if tokio::time::timeout(shutdown_timeout, server_handle).await.is_err() {
        warn!("HTTP server did not shut down in time");
    }

    match outcome {
        Ok(Ok(())) => {
            info!("Control plane shutdown complete");
            Ok(())
        }
        Ok(Err(e)) => {
            // Leadership loss is fatal: a restart rejoins as a follower.
            error!(error = %e, "Control plane stopped");
            Err(e.into())
        }
        Err(e) => {
            error!(error = %e, "Control plane task panicked");
            Err(e.into())
        }
    }
}
