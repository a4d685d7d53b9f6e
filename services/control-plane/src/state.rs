//! Application state shared across request handlers.

use std::sync::Arc;

use keel_api::Resource;
use keel_reconcile::InformerStore;
use tokio::sync::watch;

use crate::leader::LeaderState;

type SyncCheck = Box<dyn Fn() -> bool + Send + Sync>;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    identity: String,
    leader: watch::Receiver<LeaderState>,
    caches: Vec<(&'static str, SyncCheck)>,
}

impl AppState {
    pub fn builder(identity: impl Into<String>, leader: watch::Receiver<LeaderState>) -> AppStateBuilder {
        AppStateBuilder {
            identity: identity.into(),
            leader,
            caches: Vec::new(),
        }
    }

    pub fn identity(&self) -> &str {
        &self.inner.identity
    }

    pub fn leader_state(&self) -> LeaderState {
        *self.inner.leader.borrow()
    }

    /// Sync state of every registered informer cache, by kind.
    pub fn cache_sync(&self) -> impl Iterator<Item = (&'static str, bool)> + '_ {
        self.inner.caches.iter().map(|(kind, synced)| (*kind, synced()))
    }
}

pub struct AppStateBuilder {
    identity: String,
    leader: watch::Receiver<LeaderState>,
    caches: Vec<(&'static str, SyncCheck)>,
}

impl AppStateBuilder {
    /// Report `cache` in readiness.
    pub fn cache<K: Resource>(mut self, cache: InformerStore<K>) -> Self {
        self.caches
            .push((K::KIND, Box::new(move || cache.is_synced())));
        self
    }

    pub fn build(self) -> AppState {
        AppState {
            inner: Arc::new(AppStateInner {
                identity: self.identity,
                leader: self.leader,
                caches: self.caches,
            }),
        }
    }
}
