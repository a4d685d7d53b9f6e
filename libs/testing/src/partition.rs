use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use keel_api::{DynamicObject, LabelSelector};
use keel_id::ResourceVersion;
use keel_store::{
    DeleteOutcome, ObjectList, ObjectStore, Preconditions, RequestContext, Result, StoreError,
    WatchStream,
};

/// Store calls a fault can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    List,
    Create,
    Update,
    UpdateStatus,
    Delete,
    Watch,
}

#[derive(Default)]
struct Faults {
    partitioned: bool,
    /// `(verb, kind)` pairs answered with `Invalid`, which clients do not
    /// retry.
    rejected: HashSet<(Verb, String)>,
    /// Writes commit, then the reply is held back this long.
    reply_delay: Duration,
}

/// Store wrapper that one replica sees through, with injectable faults.
///
/// While partitioned every call fails with `Unavailable`. Single verbs can
/// be refused per kind, and write replies can be delayed after the write
/// has already committed. Other replicas sharing the inner store are
/// unaffected.
#[derive(Clone)]
pub struct PartitionedStore {
    inner: Arc<dyn ObjectStore>,
    faults: Arc<Mutex<Faults>>,
}

impl PartitionedStore {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self {
            inner,
            faults: Arc::new(Mutex::new(Faults::default())),
        }
    }

    fn faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn partition(&self) {
        self.faults().partitioned = true;
    }

    pub fn heal(&self) {
        let mut faults = self.faults();
        faults.partitioned = false;
        faults.rejected.clear();
        faults.reply_delay = Duration::ZERO;
    }

    pub fn is_partitioned(&self) -> bool {
        self.faults().partitioned
    }

    /// Fail every `verb` call on `kind`.
    pub fn reject(&self, verb: Verb, kind: &str) {
        self.faults().rejected.insert((verb, kind.to_string()));
    }

    /// Hold back write replies by `delay` after they commit.
    pub fn delay_replies(&self, delay: Duration) {
        self.faults().reply_delay = delay;
    }

    fn check(&self, verb: Verb, kind: &str) -> Result<()> {
        let faults = self.faults();
        if faults.partitioned {
            return Err(StoreError::Unavailable("network partition".to_string()));
        }
        if faults.rejected.contains(&(verb, kind.to_string())) {
            return Err(StoreError::Invalid(format!("{verb:?} of {kind} rejected")));
        }
        Ok(())
    }

    async fn reply<T>(&self, result: Result<T>) -> Result<T> {
        let delay = self.faults().reply_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        result
    }
}

#[async_trait]
impl ObjectStore for PartitionedStore {
    async fn get(&self, kind: &str, namespace: &str, name: &str) -> Result<DynamicObject> {
        self.check(Verb::Get, kind)?;
        self.inner.get(kind, namespace, name).await
    }

    async fn list(
        &self,
        kind: &str,
        namespace: Option<&str>,
        selector: Option<&LabelSelector>,
    ) -> Result<ObjectList> {
        self.check(Verb::List, kind)?;
        self.inner.list(kind, namespace, selector).await
    }

    async fn create(&self, ctx: &RequestContext, obj: DynamicObject) -> Result<DynamicObject> {
        self.check(Verb::Create, &obj.kind)?;
        let result = self.inner.create(ctx, obj).await;
        self.reply(result).await
    }

    async fn update(&self, ctx: &RequestContext, obj: DynamicObject) -> Result<DynamicObject> {
        self.check(Verb::Update, &obj.kind)?;
        let result = self.inner.update(ctx, obj).await;
        self.reply(result).await
    }

    async fn update_status(
        &self,
        ctx: &RequestContext,
        obj: DynamicObject,
    ) -> Result<DynamicObject> {
        self.check(Verb::UpdateStatus, &obj.kind)?;
        let result = self.inner.update_status(ctx, obj).await;
        self.reply(result).await
    }

    async fn delete(
        &self,
        ctx: &RequestContext,
        kind: &str,
        namespace: &str,
        name: &str,
        preconditions: &Preconditions,
    ) -> Result<DeleteOutcome> {
        self.check(Verb::Delete, kind)?;
        let result = self
            .inner
            .delete(ctx, kind, namespace, name, preconditions)
            .await;
        self.reply(result).await
    }

    async fn watch(
        &self,
        kind: &str,
        namespace: Option<&str>,
        since: ResourceVersion,
    ) -> Result<WatchStream> {
        self.check(Verb::Watch, kind)?;
        self.inner.watch(kind, namespace, since).await
    }
}
