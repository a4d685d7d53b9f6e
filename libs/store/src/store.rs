//! The raw object store seam.
//!
//! Every component reaches shared cluster state through [`ObjectStore`].
//! It speaks [`DynamicObject`]s; the typed [`Api`](crate::Api) wraps it.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use keel_api::{DynamicObject, LabelSelector};
use keel_id::{ObjectUid, RequestId, ResourceVersion};

use crate::{Result, StoreError};

/// Identity attached to every mutating call for audit.
///
/// The store records it but never interprets it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub actor: String,
    pub request_id: RequestId,
}

impl RequestContext {
    /// A context with a fresh request id.
    pub fn new(actor: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            request_id: RequestId::new(),
        }
    }
}

/// A point-in-time list of objects plus the store version it reflects.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectList<K = DynamicObject> {
    /// Ordered by key.
    pub items: Vec<K>,
    /// Watching from this version observes every change after the list.
    pub resource_version: ResourceVersion,
}

/// One item of a watch stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<K = DynamicObject> {
    Added(K),
    Modified(K),
    /// Carries the last state of the object, stamped with the deletion's version.
    Deleted(K),
    /// Progress marker: every change up to this version has been delivered.
    Bookmark(ResourceVersion),
    /// The stream failed. After `Gone` the caller must relist.
    Error(StoreError),
}

/// Boxed watch stream.
pub type WatchStream<K = DynamicObject> = BoxStream<'static, WatchEvent<K>>;

/// Conditions a delete must satisfy to proceed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preconditions {
    pub uid: Option<ObjectUid>,
    pub resource_version: Option<ResourceVersion>,
}

impl Preconditions {
    pub fn uid(uid: ObjectUid) -> Self {
        Self {
            uid: Some(uid),
            resource_version: None,
        }
    }
}

/// Result of a delete call.
#[derive(Debug, Clone, PartialEq)]
pub enum DeleteOutcome<K = DynamicObject> {
    /// The object was physically removed.
    Deleted(K),
    /// Finalizers remain; the object now carries a deletion timestamp.
    Pending(K),
}

impl<K> DeleteOutcome<K> {
    pub fn into_inner(self) -> K {
        match self {
            Self::Deleted(obj) | Self::Pending(obj) => obj,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }
}

/// Linearizable store of versioned objects with a watch log.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    async fn get(&self, kind: &str, namespace: &str, name: &str) -> Result<DynamicObject>;

    /// List objects of `kind`, optionally restricted to one namespace and
    /// a label selector.
    async fn list(
        &self,
        kind: &str,
        namespace: Option<&str>,
        selector: Option<&LabelSelector>,
    ) -> Result<ObjectList>;

    /// Store a new object. The store assigns uid, version and generation.
    async fn create(&self, ctx: &RequestContext, obj: DynamicObject) -> Result<DynamicObject>;

    /// Replace metadata and spec. `metadata.resourceVersion` must match the
    /// stored version. `status` in the request is ignored.
    async fn update(&self, ctx: &RequestContext, obj: DynamicObject) -> Result<DynamicObject>;

    /// Replace status only, under the same version check.
    async fn update_status(&self, ctx: &RequestContext, obj: DynamicObject)
        -> Result<DynamicObject>;

    async fn delete(
        &self,
        ctx: &RequestContext,
        kind: &str,
        namespace: &str,
        name: &str,
        preconditions: &Preconditions,
    ) -> Result<DeleteOutcome>;

    /// Stream every change to `kind` after `since`.
    async fn watch(
        &self,
        kind: &str,
        namespace: Option<&str>,
        since: ResourceVersion,
    ) -> Result<WatchStream>;
}
