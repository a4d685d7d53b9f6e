//! Watch-fed local cache of one resource collection.
//!
//! The informer drives a relist-then-watch stream and applies its events to
//! an in-memory map. Reads go through [`InformerStore`], which loads an
//! immutable snapshot without taking a lock; only the single dispatch loop
//! writes, publishing a new snapshot per event. Handlers run synchronously
//! on that loop, in event order.

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use futures_util::StreamExt;
use keel_api::{LabelSelector, ObjectKey, Resource};
use keel_id::ResourceVersion;
use keel_store::watcher::{self, Event};
use keel_store::{Api, WatcherConfig};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

type Snapshot<K> = BTreeMap<ObjectKey, Arc<K>>;

/// Callbacks fired on cache changes.
///
/// Called on the informer's dispatch loop; implementations must not block.
pub trait EventHandler<K>: Send + Sync {
    fn on_add(&self, obj: &K);
    fn on_update(&self, old: &K, new: &K);
    fn on_delete(&self, obj: &K);
}

struct Shared<K> {
    snapshot: ArcSwap<Snapshot<K>>,
    synced: watch::Sender<bool>,
}

/// Read handle to an informer's cache.
pub struct InformerStore<K> {
    shared: Arc<Shared<K>>,
}

impl<K> Clone for InformerStore<K> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<K: Resource> InformerStore<K> {
    pub fn get(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.shared.snapshot.load().get(key).cloned()
    }

    pub fn get_by_name(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.get(&ObjectKey::new(K::KIND, namespace, name))
    }

    /// Point-in-time list, ordered by key.
    pub fn list(&self) -> Vec<Arc<K>> {
        self.shared.snapshot.load().values().cloned().collect()
    }

    /// Objects in `namespace` whose labels match `selector`.
    pub fn list_matching(&self, namespace: &str, selector: &LabelSelector) -> Vec<Arc<K>> {
        self.shared
            .snapshot
            .load()
            .values()
            .filter(|obj| {
                let meta = obj.metadata();
                meta.namespace == namespace && selector.matches(&meta.labels)
            })
            .cloned()
            .collect()
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        self.shared.snapshot.load().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.shared.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once the first full list has been applied.
    pub fn is_synced(&self) -> bool {
        *self.shared.synced.borrow()
    }

    /// Wait until the first full list has been applied.
    pub async fn wait_synced(&self) {
        let mut rx = self.shared.synced.subscribe();
        // The sender lives as long as this store, so this cannot fail.
        let _ = rx.wait_for(|synced| *synced).await;
    }
}

/// Informer over one kind.
pub struct Informer<K: Resource> {
    api: Api<K>,
    config: WatcherConfig,
    shared: Arc<Shared<K>>,
    handlers: Vec<Arc<dyn EventHandler<K>>>,
}

impl<K: Resource> Informer<K> {
    pub fn new(api: Api<K>, config: WatcherConfig) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            api,
            config,
            shared: Arc::new(Shared {
                snapshot: ArcSwap::from_pointee(BTreeMap::new()),
                synced,
            }),
            handlers: Vec::new(),
        }
    }

    /// Register a handler. Must be called before [`run`](Self::run).
    pub fn add_event_handler(&mut self, handler: Arc<dyn EventHandler<K>>) {
        self.handlers.push(handler);
    }

    pub fn store(&self) -> InformerStore<K> {
        InformerStore {
            shared: self.shared.clone(),
        }
    }

    /// Run the dispatch loop until shutdown.
    #[instrument(skip_all, fields(kind = K::KIND))]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("informer starting");
        let stream = watcher::watcher(self.api.clone(), self.config.clone());
        tokio::pin!(stream);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("informer shutting down");
                        break;
                    }
                }
                next = stream.next() => match next {
                    Some(Ok(event)) => self.apply(event),
                    Some(Err(err)) => {
                        warn!(error = %err, "watch failed; serving cached state");
                    }
                    None => break,
                },
            }
        }
    }

    fn apply(&self, event: Event<K>) {
        match event {
            Event::Restarted(items, version) => self.replace(items, version),
            Event::Applied(obj) => self.upsert(obj),
            Event::Deleted(obj) => self.remove(obj),
        }
    }

    fn replace(&self, items: Vec<K>, version: ResourceVersion) {
        let old = self.shared.snapshot.load_full();
        let fresh: Snapshot<K> = items
            .into_iter()
            .map(|obj| (obj.key(), Arc::new(obj)))
            .collect();
        self.shared.snapshot.store(Arc::new(fresh.clone()));
        debug!(items = fresh.len(), %version, "cache replaced");

        for (key, obj) in &fresh {
            match old.get(key) {
                None => self.handlers.iter().for_each(|h| h.on_add(obj)),
                Some(prev) if is_newer(obj.as_ref(), prev.as_ref()) => {
                    self.handlers.iter().for_each(|h| h.on_update(prev, obj))
                }
                Some(_) => {}
            }
        }
        for (key, prev) in old.iter() {
            if !fresh.contains_key(key) {
                self.handlers.iter().for_each(|h| h.on_delete(prev));
            }
        }

        self.shared.synced.send_replace(true);
    }

    fn upsert(&self, obj: K) {
        let key = obj.key();
        let current = self.shared.snapshot.load();
        let prev = current.get(&key).cloned();
        if let Some(prev) = &prev {
            if !is_newer(&obj, prev) {
                debug!(%key, "ignoring stale event");
                return;
            }
        }

        let obj = Arc::new(obj);
        let mut next = Snapshot::clone(&current);
        next.insert(key, obj.clone());
        self.shared.snapshot.store(Arc::new(next));

        match prev {
            Some(prev) => self.handlers.iter().for_each(|h| h.on_update(&prev, &obj)),
            None => self.handlers.iter().for_each(|h| h.on_add(&obj)),
        }
    }

    fn remove(&self, obj: K) {
        let key = obj.key();
        let current = self.shared.snapshot.load();
        let Some(prev) = current.get(&key) else {
            return;
        };
        if is_newer(prev.as_ref(), &obj) {
            debug!(%key, "ignoring stale delete");
            return;
        }
        let mut next = Snapshot::clone(&current);
        next.remove(&key);
        self.shared.snapshot.store(Arc::new(next));
        self.handlers.iter().for_each(|h| h.on_delete(&obj));
    }
}

fn is_newer<K: Resource>(candidate: &K, cached: &K) -> bool {
    candidate.metadata().resource_version > cached.metadata().resource_version
}
