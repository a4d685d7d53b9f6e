//! Generic controller runtime.
//!
//! A [`Controller`] pulls keys from a [`WorkQueue`] with a pool of workers
//! and hands each to a [`Reconciler`]. Keys arrive from informer handlers
//! ([`EnqueueHandler`]) and from a periodic resync of every cached key.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use keel_api::{ObjectKey, Resource};
use keel_store::BackoffPolicy;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

use crate::informer::{EventHandler, InformerStore};
use crate::retry::RetryTracker;
use crate::{ReconcileError, WorkQueue};

/// Outcome of a successful reconcile pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Nothing more to do until the object or its dependents change.
    pub fn await_change() -> Self {
        Self {
            requeue_after: None,
        }
    }

    /// Check again after `after`, even without a change.
    pub fn requeue(after: Duration) -> Self {
        Self {
            requeue_after: Some(after),
        }
    }

    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}

/// Level-triggered reconcile logic for one kind of key.
///
/// `reconcile` must compute everything from current state (informer caches
/// and the store), never from the event that enqueued the key, and must be
/// idempotent.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &str;

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError>;

    /// Called when a key exceeds the retry budget, and again on every later
    /// failure until it succeeds. Reconcilers that own a status surface the
    /// failure there as a condition; errors here are logged, never retried.
    async fn on_poison(&self, _key: &ObjectKey, _error: &ReconcileError) -> Result<(), ReconcileError> {
        Ok(())
    }
}

/// Controller tuning.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Concurrent workers.
    pub workers: usize,
    /// Interval of the unconditional resync of every cached key.
    pub resync_period: Duration,
    /// Requeue backoff after failures.
    pub backoff: BackoffPolicy,
    /// Retries after the first consecutive failure before a key is treated
    /// as poison. Only a successful pass resets the count. `None` retries
    /// forever.
    pub max_retries: Option<u32>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            resync_period: Duration::from_secs(5 * 60),
            backoff: BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(5 * 60)),
            max_retries: None,
        }
    }
}

type KeySource = Box<dyn Fn() -> Vec<ObjectKey> + Send + Sync>;

/// Informer handler that maps each changed object to keys and enqueues them.
pub struct EnqueueHandler<K> {
    queue: WorkQueue<ObjectKey>,
    map: Box<dyn Fn(&K) -> Vec<ObjectKey> + Send + Sync>,
}

impl<K: Resource> EnqueueHandler<K> {
    /// Enqueue the changed object's own key.
    pub fn for_self(queue: WorkQueue<ObjectKey>) -> Arc<Self> {
        Arc::new(Self {
            queue,
            map: Box::new(|obj: &K| vec![obj.key()]),
        })
    }

    /// Enqueue the keys `map` derives from the changed object, e.g. its owner.
    pub fn mapped<F>(queue: WorkQueue<ObjectKey>, map: F) -> Arc<Self>
    where
        F: Fn(&K) -> Vec<ObjectKey> + Send + Sync + 'static,
    {
        Arc::new(Self {
            queue,
            map: Box::new(map),
        })
    }

    fn enqueue(&self, obj: &K) {
        for key in (self.map)(obj) {
            self.queue.add(key);
        }
    }
}

impl<K: Resource> EventHandler<K> for EnqueueHandler<K> {
    fn on_add(&self, obj: &K) {
        self.enqueue(obj);
    }

    fn on_update(&self, old: &K, new: &K) {
        self.enqueue(old);
        self.enqueue(new);
    }

    fn on_delete(&self, obj: &K) {
        self.enqueue(obj);
    }
}

/// Worker pool driving one reconciler.
pub struct Controller<R> {
    reconciler: Arc<R>,
    queue: WorkQueue<ObjectKey>,
    config: ControllerConfig,
    resync_sources: Vec<KeySource>,
    retries: Arc<Mutex<RetryTracker<ObjectKey>>>,
}

impl<R: Reconciler> Controller<R> {
    pub fn new(reconciler: Arc<R>, config: ControllerConfig) -> Self {
        Self {
            reconciler,
            queue: WorkQueue::new(config.backoff),
            retries: Arc::new(Mutex::new(RetryTracker::new(config.max_retries))),
            config,
            resync_sources: Vec::new(),
        }
    }

    /// The queue informer handlers feed.
    pub fn queue(&self) -> WorkQueue<ObjectKey> {
        self.queue.clone()
    }

    /// Include every key cached by `store` in the periodic resync.
    pub fn resync_from<K: Resource>(&mut self, store: InformerStore<K>) {
        self.resync_sources.push(Box::new(move || store.keys()));
    }

    /// Run workers until shutdown. In-flight reconciles finish first.
    #[instrument(skip_all, fields(controller = %self.reconciler.name()))]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            workers = self.config.workers,
            resync_secs = self.config.resync_period.as_secs(),
            "Starting controller"
        );

        let mut workers = JoinSet::new();
        for worker_id in 0..self.config.workers.max(1) {
            let worker = Worker {
                reconciler: self.reconciler.clone(),
                queue: self.queue.clone(),
                retries: self.retries.clone(),
                max_retries: self.config.max_retries,
            };
            let span = info_span!("worker", worker_id);
            workers.spawn(worker.run().instrument(span));
        }

        let mut resync = tokio::time::interval(self.config.resync_period);
        // Don't immediately tick on startup - informer events seed the queue
        resync.tick().await;

        loop {
            tokio::select! {
                _ = resync.tick() => {
                    let mut count = 0;
                    for source in &self.resync_sources {
                        for key in source() {
                            self.queue.add(key);
                            count += 1;
                        }
                    }
                    debug!(keys = count, "resync");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Controller shutting down");
                        break;
                    }
                }
            }
        }

        self.queue.shut_down();
        while workers.join_next().await.is_some() {}
    }
}

struct Worker<R> {
    reconciler: Arc<R>,
    queue: WorkQueue<ObjectKey>,
    retries: Arc<Mutex<RetryTracker<ObjectKey>>>,
    max_retries: Option<u32>,
}

impl<R: Reconciler> Worker<R> {
    async fn run(self) {
        while let Some(key) = self.queue.get().await {
            self.process(&key).await;
            self.queue.done(&key);
        }
    }

    async fn process(&self, key: &ObjectKey) {
        let span = info_span!("reconcile", controller = %self.reconciler.name(), %key);
        let result = self.reconciler.reconcile(key).instrument(span).await;

        match result {
            Ok(action) => {
                self.queue.forget(key);
                self.retries
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .record_success(key);
                if let Some(after) = action.requeue_after() {
                    self.queue.add_after(key.clone(), after);
                }
            }
            Err(err) => {
                let verdict = self
                    .retries
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .record_failure(key);
                let attempts = verdict.attempts();

                if verdict.is_exhausted() {
                    error!(
                        %key,
                        attempts,
                        max_retries = ?self.max_retries,
                        error = %err,
                        "Reconcile retries exhausted; giving up until the next change"
                    );
                    self.queue.forget(key);
                    if let Err(e) = self.reconciler.on_poison(key, &err).await {
                        warn!(%key, error = %e, "Failed to record poisoned key on status");
                    }
                    return;
                }

                let delay = self.queue.add_rate_limited(key.clone());
                if err.is_conflict() {
                    debug!(%key, attempts, "Reconcile conflict; requeued");
                } else {
                    warn!(
                        %key,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Reconcile failed; requeued"
                    );
                }
            }
        }
    }
}
