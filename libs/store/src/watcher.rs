//! Relist-then-watch as a restartable stream.
//!
//! [`watcher`] lists the collection, then watches from the list's version.
//! A `Gone` error sends it back to a full list; any other failure, a closed
//! stream or an idle stream reopens the watch from the last version seen.
//! Errors are yielded to the consumer and the stream keeps going when polled
//! again, backing off between consecutive failures.

use std::time::Duration;

use futures_util::{Stream, StreamExt};
use keel_api::Resource;
use keel_id::ResourceVersion;
use tracing::{debug, warn};

use crate::store::{WatchEvent, WatchStream};
use crate::{Api, BackoffPolicy, Result};

/// Watcher tuning.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// A watch delivering nothing (not even a bookmark) for this long is
    /// torn down and reopened.
    pub idle_timeout: Duration,
    /// Delay between consecutive failures.
    pub backoff: BackoffPolicy,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            backoff: BackoffPolicy::new(Duration::from_millis(200), Duration::from_secs(10)),
        }
    }
}

/// Events produced by [`watcher`].
#[derive(Debug, Clone, PartialEq)]
pub enum Event<K> {
    /// An object was added or modified.
    Applied(K),
    /// An object was deleted.
    Deleted(K),
    /// The collection was relisted; this is its complete current content,
    /// as of the given version. Deletions may have been missed.
    Restarted(Vec<K>, ResourceVersion),
}

enum State<K> {
    /// Next step lists the collection.
    Empty,
    /// Next step opens a watch from `resource_version`.
    InitListed { resource_version: ResourceVersion },
    Watching {
        resource_version: ResourceVersion,
        stream: WatchStream<K>,
    },
}

fn version_of<K: Resource>(obj: &K, fallback: ResourceVersion) -> ResourceVersion {
    obj.metadata().resource_version.unwrap_or(fallback)
}

/// Progresses the watcher one step. Returns `None` as event when the caller
/// should simply step again.
async fn step_trampolined<K: Resource>(
    api: &Api<K>,
    config: &WatcherConfig,
    state: State<K>,
) -> (Option<Result<Event<K>>>, State<K>) {
    match state {
        State::Empty => match api.list(None).await {
            Ok(list) => {
                debug!(kind = K::KIND, items = list.items.len(), version = %list.resource_version, "relisted");
                let resource_version = list.resource_version;
                (
                    Some(Ok(Event::Restarted(list.items, resource_version))),
                    State::InitListed { resource_version },
                )
            }
            Err(err) => (Some(Err(err)), State::Empty),
        },
        State::InitListed { resource_version } => match api.watch(resource_version).await {
            Ok(stream) => (
                None,
                State::Watching {
                    resource_version,
                    stream,
                },
            ),
            Err(err) if err.is_gone() => (Some(Err(err)), State::Empty),
            Err(err) => (Some(Err(err)), State::InitListed { resource_version }),
        },
        State::Watching {
            resource_version,
            mut stream,
        } => match tokio::time::timeout(config.idle_timeout, stream.next()).await {
            Err(_) => {
                warn!(kind = K::KIND, version = %resource_version, "watch idle; reopening");
                (None, State::InitListed { resource_version })
            }
            Ok(Some(WatchEvent::Added(obj))) | Ok(Some(WatchEvent::Modified(obj))) => {
                let resource_version = version_of(&obj, resource_version);
                (
                    Some(Ok(Event::Applied(obj))),
                    State::Watching {
                        resource_version,
                        stream,
                    },
                )
            }
            Ok(Some(WatchEvent::Deleted(obj))) => {
                let resource_version = version_of(&obj, resource_version);
                (
                    Some(Ok(Event::Deleted(obj))),
                    State::Watching {
                        resource_version,
                        stream,
                    },
                )
            }
            Ok(Some(WatchEvent::Bookmark(version))) => (
                None,
                State::Watching {
                    resource_version: version.max(resource_version),
                    stream,
                },
            ),
            Ok(Some(WatchEvent::Error(err))) => {
                let next = if err.is_gone() {
                    State::Empty
                } else {
                    State::InitListed { resource_version }
                };
                (Some(Err(err)), next)
            }
            Ok(None) => (None, State::InitListed { resource_version }),
        },
    }
}

struct Driver<K> {
    api: Api<K>,
    config: WatcherConfig,
    state: State<K>,
    failures: u32,
}

impl<K: Resource> Driver<K> {
    async fn step(mut self) -> Option<(Result<Event<K>>, Self)> {
        if self.failures > 0 {
            let delay = self.config.backoff.delay(self.failures - 1);
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state;
        loop {
            match step_trampolined(&self.api, &self.config, state).await {
                (Some(result), next) => {
                    if let Err(err) = &result {
                        warn!(kind = K::KIND, error = %err, "watcher error");
                        self.failures = self.failures.saturating_add(1);
                    } else {
                        self.failures = 0;
                    }
                    self.state = next;
                    return Some((result, self));
                }
                (None, next) => state = next,
            }
        }
    }
}

/// Watch every object the client can see, recovering from failures.
pub fn watcher<K: Resource>(
    api: Api<K>,
    config: WatcherConfig,
) -> impl Stream<Item = Result<Event<K>>> + Send {
    futures_util::stream::unfold(
        Driver {
            api,
            config,
            state: State::Empty,
            failures: 0,
        },
        Driver::step,
    )
}
