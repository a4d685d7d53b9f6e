//! Typed access to the object store.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures_util::StreamExt;
use keel_api::{DynamicObject, LabelSelector, Resource};
use keel_id::RequestId;
use tracing::{debug, warn};

use crate::store::{
    DeleteOutcome, ObjectList, ObjectStore, Preconditions, RequestContext, WatchEvent, WatchStream,
};
use crate::{BackoffPolicy, Result, StoreError};

/// Default number of attempts for a call hitting transient failures.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Typed client for one kind, scoped to a namespace or to all of them.
///
/// Transient store errors are retried here with capped backoff; callers only
/// see `Conflict`, `NotFound` and the like. Every mutating call carries a
/// [`RequestContext`].
pub struct Api<K> {
    store: Arc<dyn ObjectStore>,
    namespace: Option<String>,
    actor: String,
    request_id: Option<RequestId>,
    max_attempts: u32,
    backoff: BackoffPolicy,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Clone for Api<K> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            namespace: self.namespace.clone(),
            actor: self.actor.clone(),
            request_id: self.request_id,
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            _kind: PhantomData,
        }
    }
}

impl<K> std::fmt::Debug for Api<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Api")
            .field("namespace", &self.namespace)
            .field("actor", &self.actor)
            .finish_non_exhaustive()
    }
}

impl<K: Resource> Api<K> {
    fn with_scope(store: Arc<dyn ObjectStore>, namespace: Option<String>) -> Self {
        Self {
            store,
            namespace,
            actor: "anonymous".to_string(),
            request_id: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: BackoffPolicy::default(),
            _kind: PhantomData,
        }
    }

    /// Client for one namespace.
    pub fn namespaced(store: Arc<dyn ObjectStore>, namespace: impl Into<String>) -> Self {
        Self::with_scope(store, Some(namespace.into()))
    }

    /// Client for a cluster-scoped kind.
    pub fn cluster(store: Arc<dyn ObjectStore>) -> Self {
        Self::with_scope(store, Some(String::new()))
    }

    /// Client spanning every namespace. `list` and `watch` see all objects;
    /// single-object calls use the object's own namespace.
    pub fn all(store: Arc<dyn ObjectStore>) -> Self {
        Self::with_scope(store, None)
    }

    /// The same client scoped to `namespace`.
    pub fn within(&self, namespace: &str) -> Self {
        let mut api = self.clone();
        api.namespace = Some(namespace.to_string());
        api
    }

    /// Attribute calls to `actor`, with a fresh request id per call.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self.request_id = None;
        self
    }

    /// Attribute every call to this exact context.
    pub fn with_context(mut self, ctx: RequestContext) -> Self {
        self.actor = ctx.actor;
        self.request_id = Some(ctx.request_id);
        self
    }

    /// Attempts per call before a transient error is returned. `1` disables retry.
    pub fn with_retry(mut self, max_attempts: u32, backoff: BackoffPolicy) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.backoff = backoff;
        self
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    fn context(&self) -> RequestContext {
        RequestContext {
            actor: self.actor.clone(),
            request_id: self.request_id.unwrap_or_default(),
        }
    }

    fn scoped_namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or_default()
    }

    /// Run `op` until it succeeds, fails non-transiently or runs out of attempts.
    async fn retry<T, F, Fut>(&self, op_name: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(err) if err.is_transient() && attempt + 1 < self.max_attempts => {
                    let delay = self.backoff.delay(attempt);
                    warn!(
                        kind = K::KIND,
                        op = op_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient store error; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Put the object into this client's namespace, rejecting mismatches.
    fn scope_object(&self, obj: &mut K) -> Result<()> {
        if let Some(ns) = &self.namespace {
            let meta = obj.metadata_mut();
            if meta.namespace.is_empty() {
                meta.namespace = ns.clone();
            } else if &meta.namespace != ns {
                return Err(StoreError::Invalid(format!(
                    "object namespace '{}' does not match client namespace '{ns}'",
                    meta.namespace
                )));
            }
        }
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Result<K> {
        let obj = self
            .retry("get", || self.store.get(K::KIND, self.scoped_namespace(), name))
            .await?;
        Ok(obj.into_resource()?)
    }

    /// Like `get`, mapping `NotFound` to `None`.
    pub async fn get_opt(&self, name: &str) -> Result<Option<K>> {
        match self.get(name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn list(&self, selector: Option<&LabelSelector>) -> Result<ObjectList<K>> {
        let list = self
            .retry("list", || {
                self.store.list(K::KIND, self.namespace.as_deref(), selector)
            })
            .await?;
        let items = list
            .items
            .into_iter()
            .map(DynamicObject::into_resource)
            .collect::<std::result::Result<Vec<K>, _>>()?;
        Ok(ObjectList {
            items,
            resource_version: list.resource_version,
        })
    }

    pub async fn create(&self, obj: &K) -> Result<K> {
        let mut obj = obj.clone();
        self.scope_object(&mut obj)?;
        let raw = DynamicObject::from_resource(&obj)?;
        let ctx = self.context();
        let created = self
            .retry("create", || self.store.create(&ctx, raw.clone()))
            .await?;
        debug!(key = %created.key(), actor = %ctx.actor, "created");
        Ok(created.into_resource()?)
    }

    /// Write metadata and spec; fails with `Conflict` on a stale version.
    pub async fn update(&self, obj: &K) -> Result<K> {
        let raw = DynamicObject::from_resource(obj)?;
        let ctx = self.context();
        let updated = self
            .retry("update", || self.store.update(&ctx, raw.clone()))
            .await?;
        Ok(updated.into_resource()?)
    }

    /// Write status only; fails with `Conflict` on a stale version.
    pub async fn update_status(&self, obj: &K) -> Result<K> {
        let raw = DynamicObject::from_resource(obj)?;
        let ctx = self.context();
        let updated = self
            .retry("update_status", || self.store.update_status(&ctx, raw.clone()))
            .await?;
        Ok(updated.into_resource()?)
    }

    pub async fn delete(&self, name: &str, preconditions: &Preconditions) -> Result<DeleteOutcome<K>> {
        let ctx = self.context();
        let outcome = self
            .retry("delete", || {
                self.store
                    .delete(&ctx, K::KIND, self.scoped_namespace(), name, preconditions)
            })
            .await?;
        Ok(match outcome {
            DeleteOutcome::Deleted(obj) => DeleteOutcome::Deleted(obj.into_resource()?),
            DeleteOutcome::Pending(obj) => DeleteOutcome::Pending(obj.into_resource()?),
        })
    }

    /// Delete `obj`, guarded by its uid so a recreated namesake is untouched.
    pub async fn delete_object(&self, obj: &K) -> Result<DeleteOutcome<K>> {
        let meta = obj.metadata();
        let preconditions = Preconditions {
            uid: meta.uid,
            resource_version: None,
        };
        self.within(&meta.namespace)
            .delete(&meta.name, &preconditions)
            .await
    }

    /// Typed watch from `since`. Conversion failures surface as `Error` events.
    pub async fn watch(&self, since: keel_id::ResourceVersion) -> Result<WatchStream<K>> {
        let stream = self
            .retry("watch", || {
                self.store.watch(K::KIND, self.namespace.as_deref(), since)
            })
            .await?;
        Ok(stream.map(convert_event::<K>).boxed())
    }
}

fn convert_event<K: Resource>(event: WatchEvent) -> WatchEvent<K> {
    let convert = |obj: DynamicObject| obj.into_resource::<K>().map_err(StoreError::from);
    match event {
        WatchEvent::Added(obj) => convert(obj).map_or_else(WatchEvent::Error, WatchEvent::Added),
        WatchEvent::Modified(obj) => {
            convert(obj).map_or_else(WatchEvent::Error, WatchEvent::Modified)
        }
        WatchEvent::Deleted(obj) => {
            convert(obj).map_or_else(WatchEvent::Error, WatchEvent::Deleted)
        }
        WatchEvent::Bookmark(version) => WatchEvent::Bookmark(version),
        WatchEvent::Error(err) => WatchEvent::Error(err),
    }
}
