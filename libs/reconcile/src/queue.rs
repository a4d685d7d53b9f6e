//! Deduplicating work queue with at-most-one in-flight processing per key.
//!
//! An item moves `queued -> processing -> done`. Adding an item that is
//! already queued is a no-op. Adding an item that is being processed marks
//! it dirty; it is queued again when the current run calls [`WorkQueue::done`],
//! so the same key is never handed to two workers at once.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use keel_store::BackoffPolicy;
use tokio::sync::Notify;

struct QueueState<T> {
    queue: VecDeque<T>,
    /// Items waiting to be processed, whether queued or parked behind a run.
    dirty: HashSet<T>,
    processing: HashSet<T>,
    requeues: HashMap<T, u32>,
    shutting_down: bool,
}

struct QueueInner<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
    backoff: BackoffPolicy,
}

/// Cloneable handle to a shared work queue.
pub struct WorkQueue<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> std::fmt::Debug for WorkQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("backoff", &self.inner.backoff)
            .finish_non_exhaustive()
    }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// Create a queue whose rate-limited adds follow `backoff`.
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    requeues: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                backoff,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState<T>> {
        // Critical sections never panic midway; a poisoned lock still holds
        // consistent state.
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue an item unless it is already waiting.
    pub fn add(&self, item: T) {
        let mut state = self.state();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Enqueue an item once `delay` has passed.
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        if self.is_shutting_down() {
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Enqueue after the item's next backoff delay. Returns the delay used.
    pub fn add_rate_limited(&self, item: T) -> Duration {
        let attempt = {
            let mut state = self.state();
            let count = state.requeues.entry(item.clone()).or_insert(0);
            let attempt = *count;
            *count += 1;
            attempt
        };
        let delay = self.inner.backoff.delay(attempt);
        self.add_after(item, delay);
        delay
    }

    /// Reset the item's backoff.
    pub fn forget(&self, item: &T) {
        self.state().requeues.remove(item);
    }

    /// Rate-limited requeues of the item since it was last forgotten.
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.state().requeues.get(item).copied().unwrap_or(0)
    }

    /// Wait for the next item. Returns `None` once the queue is shut down.
    ///
    /// The caller owns the item until it calls [`done`](Self::done).
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if state.shutting_down {
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.inner.notify.notify_one();
                    }
                    return Some(item);
                }
            }

            notified.await;
        }
    }

    /// Mark processing of `item` finished, re-queueing it if it was added
    /// in the meantime.
    pub fn done(&self, item: &T) {
        let mut state = self.state();
        state.processing.remove(item);
        if state.dirty.contains(item) && !state.shutting_down {
            state.queue.push_back(item.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Stop handing out items. Workers blocked in `get` return `None`;
    /// items already handed out may still call `done`.
    pub fn shut_down(&self) {
        self.state().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }

    /// Items queued and not yet handed out.
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items currently handed out to workers.
    pub fn in_flight(&self) -> usize {
        self.state().processing.len()
    }
}
