//! Informer caches over an in-memory store, for reconciler unit tests.

use std::sync::Arc;
use std::time::Duration;

use keel_api::Resource;
use keel_reconcile::{Informer, InformerStore};
use keel_store::{Api, MemoryStore, ObjectStore, WatcherConfig};
use keel_testing::wait_until;
use tokio::sync::watch;

pub(crate) struct Fixture {
    pub store: Arc<dyn ObjectStore>,
    shutdown: watch::Sender<bool>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::over(Arc::new(MemoryStore::default()))
    }

    pub fn over(store: Arc<dyn ObjectStore>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self { store, shutdown }
    }

    pub fn api<K: Resource>(&self) -> Api<K> {
        Api::all(self.store.clone()).with_actor("tests")
    }

    /// Start an informer for `K` and wait for its first list.
    pub async fn cache<K: Resource>(&self) -> InformerStore<K> {
        let informer = Informer::new(Api::<K>::all(self.store.clone()), WatcherConfig::default());
        let cache = informer.store();
        tokio::spawn(informer.run(self.shutdown.subscribe()));
        cache.wait_synced().await;
        cache
    }

    /// Stop every informer. Caches keep what they last saw.
    pub fn freeze(&self) {
        self.shutdown.send_replace(true);
    }
}

/// Wait for a cache to reflect a write.
pub(crate) async fn settle(what: &str, mut condition: impl FnMut() -> bool) {
    let held = wait_until(Duration::from_secs(5), Duration::from_millis(5), || {
        let held = condition();
        async move { held }
    })
    .await;
    assert!(held, "cache never showed {what}");
}
