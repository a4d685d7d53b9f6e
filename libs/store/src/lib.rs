//! # keel-store
//!
//! Object Store Client: versioned objects with optimistic concurrency,
//! finalizer-aware deletion and restartable watches.
//!
//! ## Layers
//!
//! - [`ObjectStore`]: the raw seam every component is handed; speaks
//!   [`DynamicObject`](keel_api::DynamicObject)s
//! - [`MemoryStore`]: in-process backend with a bounded watch history
//! - [`Api`]: typed client per kind, retrying transient failures
//! - [`watcher()`]: relist-then-watch stream with idle detection
//!
//! ## Concurrency
//!
//! The store is the only arbiter of write conflicts. An `update` carrying a
//! stale `resourceVersion` fails with [`StoreError::Conflict`]; the caller
//! re-reads and retries.

mod backoff;
mod client;
mod error;
mod memory;
mod store;
pub mod watcher;

pub use backoff::BackoffPolicy;
pub use client::{Api, DEFAULT_MAX_ATTEMPTS};
pub use error::{Result, StoreError};
pub use memory::{AuditRecord, MemoryStore, MemoryStoreConfig};
pub use store::{
    DeleteOutcome, ObjectList, ObjectStore, Preconditions, RequestContext, WatchEvent, WatchStream,
};
pub use watcher::{watcher, WatcherConfig};
