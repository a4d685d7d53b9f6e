//! In-process reference backend for [`ObjectStore`].
//!
//! A single global revision counter orders every write. A bounded history
//! of changes backs `watch`; versions older than the history yield
//! [`StoreError::Gone`].

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use keel_api::{validate_name, DynamicObject, LabelSelector, ObjectKey};
use keel_id::{Generation, ObjectUid, RequestId, ResourceVersion};
use tokio::sync::{broadcast, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::store::{
    DeleteOutcome, ObjectList, ObjectStore, Preconditions, RequestContext, WatchEvent, WatchStream,
};
use crate::{Result, StoreError};

/// Memory store tuning.
#[derive(Debug, Clone)]
pub struct MemoryStoreConfig {
    /// Number of changes retained for watch resumption.
    pub history_limit: usize,
    /// How often idle watches receive a bookmark.
    pub bookmark_interval: Duration,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            history_limit: 1024,
            bookmark_interval: Duration::from_secs(5),
        }
    }
}

/// One entry of the audit trail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    pub resource_version: ResourceVersion,
    pub verb: &'static str,
    pub key: ObjectKey,
    pub actor: String,
    pub request_id: RequestId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChangeType {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug)]
struct Change {
    change_type: ChangeType,
    object: DynamicObject,
}

impl Change {
    fn version(&self) -> ResourceVersion {
        self.object.metadata.resource_version.unwrap_or_default()
    }

    fn matches(&self, kind: &str, namespace: Option<&str>) -> bool {
        self.object.kind == kind
            && namespace.is_none_or(|ns| self.object.metadata.namespace == ns)
    }

    fn to_event(&self) -> WatchEvent {
        let object = self.object.clone();
        match self.change_type {
            ChangeType::Added => WatchEvent::Added(object),
            ChangeType::Modified => WatchEvent::Modified(object),
            ChangeType::Deleted => WatchEvent::Deleted(object),
        }
    }
}

#[derive(Debug, Clone)]
enum Signal {
    Change(Arc<Change>),
    Reset,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectKey, DynamicObject>,
    revision: ResourceVersion,
    history: VecDeque<Arc<Change>>,
    /// Highest version no longer present in `history`.
    compacted: ResourceVersion,
    audit: VecDeque<AuditRecord>,
    unavailable: bool,
    injected_failures: u32,
}

impl State {
    fn check_available(&mut self) -> Result<()> {
        if self.unavailable {
            return Err(StoreError::Unavailable("store is unreachable".to_string()));
        }
        if self.injected_failures > 0 {
            self.injected_failures -= 1;
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }

    fn next_version(&mut self) -> ResourceVersion {
        self.revision = self.revision.next();
        self.revision
    }

    fn current(&self, key: &ObjectKey) -> Result<&DynamicObject> {
        self.objects
            .get(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }
}

struct Inner {
    state: Mutex<State>,
    events: broadcast::Sender<Signal>,
    config: MemoryStoreConfig,
}

/// Cloneable handle to an in-memory object store.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(MemoryStoreConfig::default())
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl MemoryStore {
    pub fn new(config: MemoryStoreConfig) -> Self {
        let (events, _) = broadcast::channel(config.history_limit.max(16));
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                events,
                config,
            }),
        }
    }

    /// Current global revision.
    pub async fn revision(&self) -> ResourceVersion {
        self.inner.state.lock().await.revision
    }

    /// Drop the whole change history. Watches from any earlier version
    /// now fail with `Gone`.
    pub async fn compact(&self) {
        let mut state = self.inner.state.lock().await;
        state.history.clear();
        state.compacted = state.revision;
        info!(compacted = %state.compacted, "compacted watch history");
    }

    /// Terminate every open watch stream, as a dropped connection would.
    pub fn reset_watches(&self) {
        let _ = self.inner.events.send(Signal::Reset);
    }

    /// Make every call fail with `Unavailable` until cleared. Open watches
    /// are reset.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.inner.state.lock().await.unavailable = unavailable;
        if unavailable {
            self.reset_watches();
        }
    }

    /// Fail the next `count` calls with `Unavailable`.
    pub async fn inject_failures(&self, count: u32) {
        self.inner.state.lock().await.injected_failures = count;
    }

    /// Audit records of retained writes, oldest first.
    pub async fn audit_trail(&self) -> Vec<AuditRecord> {
        self.inner.state.lock().await.audit.iter().cloned().collect()
    }

    fn record(
        &self,
        state: &mut State,
        ctx: &RequestContext,
        verb: &'static str,
        change_type: ChangeType,
        object: DynamicObject,
    ) {
        let key = object.key();
        let change = Arc::new(Change {
            change_type,
            object,
        });
        let version = change.version();
        debug!(%key, %version, actor = %ctx.actor, request_id = %ctx.request_id, verb, "write committed");

        let limit = self.inner.config.history_limit;
        state.history.push_back(change.clone());
        while state.history.len() > limit {
            if let Some(dropped) = state.history.pop_front() {
                state.compacted = dropped.version();
            }
        }
        state.audit.push_back(AuditRecord {
            resource_version: version,
            verb,
            key,
            actor: ctx.actor.clone(),
            request_id: ctx.request_id,
        });
        while state.audit.len() > limit {
            state.audit.pop_front();
        }

        // No subscribers is fine.
        let _ = self.inner.events.send(Signal::Change(change));
    }
}

fn check_version(key: &ObjectKey, current: &DynamicObject, requested: &DynamicObject) -> Result<()> {
    let Some(version) = requested.metadata.resource_version else {
        return Err(StoreError::Invalid(format!(
            "{key}: resourceVersion is required for update"
        )));
    };
    if Some(version) != current.metadata.resource_version {
        return Err(StoreError::conflict(
            key,
            format!(
                "the object has been modified: requested version {version}, stored {}",
                current.metadata.resource_version.unwrap_or_default()
            ),
        ));
    }
    if let Some(uid) = requested.metadata.uid {
        if Some(uid) != current.metadata.uid {
            return Err(StoreError::conflict(key, "uid does not match stored object"));
        }
    }
    Ok(())
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, kind: &str, namespace: &str, name: &str) -> Result<DynamicObject> {
        let mut state = self.inner.state.lock().await;
        state.check_available()?;
        state
            .current(&ObjectKey::new(kind, namespace, name))
            .cloned()
    }

    async fn list(
        &self,
        kind: &str,
        namespace: Option<&str>,
        selector: Option<&LabelSelector>,
    ) -> Result<ObjectList> {
        let mut state = self.inner.state.lock().await;
        state.check_available()?;
        let items = state
            .objects
            .range(ObjectKey::new(kind, "", "")..)
            .take_while(|(key, _)| key.kind == kind)
            .filter(|(key, _)| namespace.is_none_or(|ns| key.namespace == ns))
            .filter(|(_, obj)| selector.is_none_or(|s| s.matches(&obj.metadata.labels)))
            .map(|(_, obj)| obj.clone())
            .collect();
        Ok(ObjectList {
            items,
            resource_version: state.revision,
        })
    }

    async fn create(&self, ctx: &RequestContext, mut obj: DynamicObject) -> Result<DynamicObject> {
        if obj.kind.is_empty() {
            return Err(StoreError::Invalid("kind is required".to_string()));
        }
        validate_name(&obj.metadata.name)?;

        let mut state = self.inner.state.lock().await;
        state.check_available()?;
        let key = obj.key();
        if state.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key));
        }

        let version = state.next_version();
        let meta = &mut obj.metadata;
        meta.uid = Some(ObjectUid::new());
        meta.resource_version = Some(version);
        meta.generation = Generation::FIRST;
        meta.creation_timestamp = Some(Utc::now());
        meta.deletion_timestamp = None;

        state.objects.insert(key, obj.clone());
        self.record(&mut state, ctx, "create", ChangeType::Added, obj.clone());
        Ok(obj)
    }

    async fn update(&self, ctx: &RequestContext, obj: DynamicObject) -> Result<DynamicObject> {
        let mut state = self.inner.state.lock().await;
        state.check_available()?;
        let key = obj.key();
        let current = state.current(&key)?;
        check_version(&key, current, &obj)?;

        if current.metadata.is_deleting()
            && obj
                .metadata
                .finalizers
                .iter()
                .any(|f| !current.metadata.has_finalizer(f))
        {
            return Err(StoreError::Invalid(format!(
                "{key}: finalizers cannot be added while the object is being deleted"
            )));
        }

        let mut next = current.clone();
        let spec_changed = next.spec != obj.spec;
        next.spec = obj.spec;
        next.metadata.labels = obj.metadata.labels;
        next.metadata.annotations = obj.metadata.annotations;
        next.metadata.owner_references = obj.metadata.owner_references;
        next.metadata.finalizers = obj.metadata.finalizers;
        if spec_changed {
            next.metadata.generation = next.metadata.generation.next();
        }
        if &next == current {
            return Ok(next);
        }

        next.metadata.resource_version = Some(state.next_version());
        if next.metadata.is_deleting() && next.metadata.finalizers.is_empty() {
            state.objects.remove(&key);
            self.record(&mut state, ctx, "update", ChangeType::Deleted, next.clone());
        } else {
            state.objects.insert(key, next.clone());
            self.record(&mut state, ctx, "update", ChangeType::Modified, next.clone());
        }
        Ok(next)
    }

    async fn update_status(
        &self,
        ctx: &RequestContext,
        obj: DynamicObject,
    ) -> Result<DynamicObject> {
        let mut state = self.inner.state.lock().await;
        state.check_available()?;
        let key = obj.key();
        let current = state.current(&key)?;
        check_version(&key, current, &obj)?;

        if current.status == obj.status {
            return Ok(current.clone());
        }
        let mut next = current.clone();
        next.status = obj.status;
        next.metadata.resource_version = Some(state.next_version());
        state.objects.insert(key, next.clone());
        self.record(&mut state, ctx, "update_status", ChangeType::Modified, next.clone());
        Ok(next)
    }

    async fn delete(
        &self,
        ctx: &RequestContext,
        kind: &str,
        namespace: &str,
        name: &str,
        preconditions: &Preconditions,
    ) -> Result<DeleteOutcome> {
        let mut state = self.inner.state.lock().await;
        state.check_available()?;
        let key = ObjectKey::new(kind, namespace, name);
        let current = state.current(&key)?;

        if let Some(uid) = preconditions.uid {
            if current.metadata.uid != Some(uid) {
                return Err(StoreError::conflict(&key, "uid precondition failed"));
            }
        }
        if let Some(version) = preconditions.resource_version {
            if current.metadata.resource_version != Some(version) {
                return Err(StoreError::conflict(
                    &key,
                    "resourceVersion precondition failed",
                ));
            }
        }

        if !current.metadata.finalizers.is_empty() {
            if current.metadata.is_deleting() {
                return Ok(DeleteOutcome::Pending(current.clone()));
            }
            let mut next = current.clone();
            next.metadata.deletion_timestamp = Some(Utc::now());
            next.metadata.resource_version = Some(state.next_version());
            state.objects.insert(key, next.clone());
            self.record(&mut state, ctx, "delete", ChangeType::Modified, next.clone());
            return Ok(DeleteOutcome::Pending(next));
        }

        let mut removed = state
            .objects
            .remove(&key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        removed.metadata.resource_version = Some(state.next_version());
        self.record(&mut state, ctx, "delete", ChangeType::Deleted, removed.clone());
        Ok(DeleteOutcome::Deleted(removed))
    }

    async fn watch(
        &self,
        kind: &str,
        namespace: Option<&str>,
        since: ResourceVersion,
    ) -> Result<WatchStream> {
        let mut state = self.inner.state.lock().await;
        state.check_available()?;
        if since < state.compacted {
            return Err(StoreError::Gone {
                requested: since,
                oldest: state.compacted,
            });
        }

        let backlog = state
            .history
            .iter()
            .filter(|c| c.version() > since && c.matches(kind, namespace))
            .cloned()
            .collect();
        // Subscribed under the lock: no change can slip between backlog and live feed.
        let rx = self.inner.events.subscribe();

        let period = self.inner.config.bookmark_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let cursor = WatchCursor {
            kind: kind.to_string(),
            namespace: namespace.map(str::to_string),
            since,
            backlog,
            rx,
            progress: state.revision.max(since),
            bookmarked: since,
            ticker,
            done: false,
        };
        Ok(futures_util::stream::unfold(cursor, WatchCursor::next).boxed())
    }
}

struct WatchCursor {
    kind: String,
    namespace: Option<String>,
    since: ResourceVersion,
    backlog: VecDeque<Arc<Change>>,
    rx: broadcast::Receiver<Signal>,
    /// Every change up to here has been seen by this stream.
    progress: ResourceVersion,
    bookmarked: ResourceVersion,
    ticker: tokio::time::Interval,
    done: bool,
}

impl WatchCursor {
    async fn next(mut self) -> Option<(WatchEvent, Self)> {
        if self.done {
            return None;
        }
        if let Some(change) = self.backlog.pop_front() {
            return Some((change.to_event(), self));
        }
        loop {
            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Ok(Signal::Change(change)) => {
                        self.progress = self.progress.max(change.version());
                        if change.version() > self.since
                            && change.matches(&self.kind, self.namespace.as_deref())
                        {
                            return Some((change.to_event(), self));
                        }
                    }
                    Ok(Signal::Reset) => {
                        self.done = true;
                        let err = StoreError::Unavailable("watch connection reset".to_string());
                        return Some((WatchEvent::Error(err), self));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(kind = %self.kind, skipped, "watch fell behind");
                        self.done = true;
                        let err = StoreError::Gone {
                            requested: self.progress,
                            oldest: self.progress,
                        };
                        return Some((WatchEvent::Error(err), self));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
                _ = self.ticker.tick() => {
                    if self.progress > self.bookmarked {
                        self.bookmarked = self.progress;
                        return Some((WatchEvent::Bookmark(self.progress), self));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_api::{ObjectMeta, FOREGROUND_DELETION_FINALIZER};
    use serde_json::json;

    fn ctx() -> RequestContext {
        RequestContext::new("test")
    }

    fn object(name: &str) -> DynamicObject {
        DynamicObject {
            kind: "Widget".to_string(),
            metadata: ObjectMeta::namespaced("default", name),
            spec: json!({"size": 1}),
            status: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn test_create_assigns_identity() {
        let store = MemoryStore::default();
        let created = store.create(&ctx(), object("a")).await.unwrap();

        assert!(created.metadata.uid.is_some());
        assert_eq!(created.metadata.resource_version, Some(ResourceVersion::new(1)));
        assert_eq!(created.metadata.generation, Generation::FIRST);
        assert!(created.metadata.creation_timestamp.is_some());

        let err = store.create(&ctx(), object("a")).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_name() {
        let store = MemoryStore::default();
        let err = store.create(&ctx(), object("Bad_Name")).await.unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let store = MemoryStore::default();
        let created = store.create(&ctx(), object("a")).await.unwrap();

        let mut first = created.clone();
        first.spec = json!({"size": 2});
        store.update(&ctx(), first).await.unwrap();

        let mut second = created;
        second.spec = json!({"size": 3});
        let err = store.update(&ctx(), second).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_generation_tracks_spec_only() {
        let store = MemoryStore::default();
        let mut obj = store.create(&ctx(), object("a")).await.unwrap();

        obj.metadata.labels.insert("x".into(), "y".into());
        obj = store.update(&ctx(), obj).await.unwrap();
        assert_eq!(obj.metadata.generation, Generation::FIRST);

        obj.status = json!({"ready": true});
        obj = store.update_status(&ctx(), obj).await.unwrap();
        assert_eq!(obj.metadata.generation, Generation::FIRST);

        obj.spec = json!({"size": 9});
        obj = store.update(&ctx(), obj).await.unwrap();
        assert_eq!(obj.metadata.generation.value(), 2);
        assert_eq!(obj.status, json!({"ready": true}));
    }

    #[tokio::test]
    async fn test_noop_update_keeps_version() {
        let store = MemoryStore::default();
        let obj = store.create(&ctx(), object("a")).await.unwrap();
        let same = store.update(&ctx(), obj.clone()).await.unwrap();
        assert_eq!(same.metadata.resource_version, obj.metadata.resource_version);
        assert_eq!(store.revision().await, ResourceVersion::new(1));
    }

    #[tokio::test]
    async fn test_update_ignores_status() {
        let store = MemoryStore::default();
        let mut obj = store.create(&ctx(), object("a")).await.unwrap();
        obj.status = json!({"ready": true});
        let updated = store.update(&ctx(), obj).await.unwrap();
        assert!(updated.status.is_null());
    }

    #[tokio::test]
    async fn test_delete_preconditions() {
        let store = MemoryStore::default();
        let obj = store.create(&ctx(), object("a")).await.unwrap();

        let wrong = Preconditions::uid(ObjectUid::new());
        let err = store
            .delete(&ctx(), "Widget", "default", "a", &wrong)
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let stale = Preconditions {
            uid: None,
            resource_version: Some(ResourceVersion::new(99)),
        };
        assert!(store
            .delete(&ctx(), "Widget", "default", "a", &stale)
            .await
            .unwrap_err()
            .is_conflict());

        let exact = Preconditions {
            uid: obj.metadata.uid,
            resource_version: obj.metadata.resource_version,
        };
        let outcome = store
            .delete(&ctx(), "Widget", "default", "a", &exact)
            .await
            .unwrap();
        assert!(!outcome.is_pending());
        assert!(store.get("Widget", "default", "a").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_finalizer_cannot_be_added_while_deleting() {
        let store = MemoryStore::default();
        let mut obj = object("a");
        obj.metadata.finalizers.push("keep".into());
        store.create(&ctx(), obj).await.unwrap();

        let mut pending = store
            .delete(&ctx(), "Widget", "default", "a", &Preconditions::default())
            .await
            .unwrap()
            .into_inner();
        pending
            .metadata
            .finalizers
            .push(FOREGROUND_DELETION_FINALIZER.to_string());
        let err = store.update(&ctx(), pending).await.unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_list_filters_and_orders() {
        let store = MemoryStore::default();
        for name in ["c", "a", "b"] {
            let mut obj = object(name);
            if name != "b" {
                obj.metadata.labels.insert("tier".into(), "web".into());
            }
            store.create(&ctx(), obj).await.unwrap();
        }
        let mut other = object("z");
        other.metadata.namespace = "prod".into();
        store.create(&ctx(), other).await.unwrap();

        let all = store.list("Widget", None, None).await.unwrap();
        assert_eq!(all.items.len(), 4);
        assert_eq!(all.resource_version, ResourceVersion::new(4));

        let selector = LabelSelector::from_labels([("tier", "web")]);
        let web = store
            .list("Widget", Some("default"), Some(&selector))
            .await
            .unwrap();
        let names: Vec<_> = web.items.iter().map(|o| o.metadata.name.as_str()).collect();
        assert_eq!(names, vec!["a", "c"]);

        assert!(store.list("Gadget", None, None).await.unwrap().items.is_empty());
    }

    #[tokio::test]
    async fn test_watch_replays_history_then_streams() {
        let store = MemoryStore::default();
        store.create(&ctx(), object("a")).await.unwrap();
        let mut stream = store
            .watch("Widget", None, ResourceVersion::ZERO)
            .await
            .unwrap();

        store.create(&ctx(), object("b")).await.unwrap();

        let first = stream.next().await.unwrap();
        assert!(matches!(first, WatchEvent::Added(ref o) if o.metadata.name == "a"));
        let second = stream.next().await.unwrap();
        assert!(matches!(second, WatchEvent::Added(ref o) if o.metadata.name == "b"));
    }

    #[tokio::test]
    async fn test_watch_from_compacted_version_is_gone() {
        let store = MemoryStore::default();
        store.create(&ctx(), object("a")).await.unwrap();
        store.compact().await;

        let err = match store.watch("Widget", None, ResourceVersion::ZERO).await {
            Err(err) => err,
            Ok(_) => panic!("watch from compacted version should fail"),
        };
        assert!(err.is_gone());
        assert!(store
            .watch("Widget", None, store.revision().await)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_history_limit_compacts() {
        let store = MemoryStore::new(MemoryStoreConfig {
            history_limit: 2,
            ..Default::default()
        });
        for name in ["a", "b", "c"] {
            store.create(&ctx(), object(name)).await.unwrap();
        }
        assert!(store
            .watch("Widget", None, ResourceVersion::ZERO)
            .await
            .is_err());
        assert!(store
            .watch("Widget", None, ResourceVersion::new(1))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_reset_ends_stream_with_error() {
        let store = MemoryStore::default();
        let mut stream = store
            .watch("Widget", None, ResourceVersion::ZERO)
            .await
            .unwrap();
        store.reset_watches();

        assert!(matches!(
            stream.next().await,
            Some(WatchEvent::Error(StoreError::Unavailable(_)))
        ));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_watch_receives_bookmark() {
        let store = MemoryStore::default();
        let mut stream = store
            .watch("Widget", None, ResourceVersion::ZERO)
            .await
            .unwrap();

        let mut gadget = object("g");
        gadget.kind = "Gadget".into();
        store.create(&ctx(), gadget).await.unwrap();

        assert_eq!(
            stream.next().await,
            Some(WatchEvent::Bookmark(ResourceVersion::new(1)))
        );
    }

    #[tokio::test]
    async fn test_unavailable_and_injected_failures() {
        let store = MemoryStore::default();
        store.set_unavailable(true).await;
        assert!(store.get("Widget", "default", "a").await.unwrap_err().is_transient());
        store.set_unavailable(false).await;

        store.inject_failures(1).await;
        assert!(store.list("Widget", None, None).await.unwrap_err().is_transient());
        assert!(store.list("Widget", None, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_audit_trail_records_actor() {
        let store = MemoryStore::default();
        let ctx = RequestContext::new("scheduler");
        store.create(&ctx, object("a")).await.unwrap();

        let trail = store.audit_trail().await;
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].actor, "scheduler");
        assert_eq!(trail[0].request_id, ctx.request_id);
        assert_eq!(trail[0].verb, "create");
    }
}
