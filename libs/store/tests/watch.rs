//! Relist-then-watch recovery.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use keel_api::Pod;
use keel_store::watcher::Event;
use keel_store::{
    watcher, Api, BackoffPolicy, MemoryStore, ObjectStore, Preconditions, WatcherConfig,
};

fn pods(store: &MemoryStore) -> Api<Pod> {
    let store: Arc<dyn ObjectStore> = Arc::new(store.clone());
    Api::namespaced(store, "default").with_actor("tests")
}

fn config() -> WatcherConfig {
    WatcherConfig {
        idle_timeout: Duration::from_secs(30),
        backoff: BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(50)),
    }
}

fn names(items: &[Pod]) -> Vec<&str> {
    items.iter().map(|p| p.metadata.name.as_str()).collect()
}

#[tokio::test]
async fn starts_with_a_full_list() {
    let store = MemoryStore::default();
    let api = pods(&store);
    api.create(&Pod::new("default", "a")).await.unwrap();
    api.create(&Pod::new("default", "b")).await.unwrap();

    let mut events = Box::pin(watcher(api.clone(), config()));
    match events.next().await.unwrap().unwrap() {
        Event::Restarted(items, version) => {
            assert_eq!(names(&items), vec!["a", "b"]);
            assert_eq!(version, store.revision().await);
        }
        other => panic!("expected restart, got {other:?}"),
    }

    api.create(&Pod::new("default", "c")).await.unwrap();
    assert!(matches!(
        events.next().await.unwrap().unwrap(),
        Event::Applied(ref p) if p.metadata.name == "c"
    ));

    api.delete("a", &Preconditions::default()).await.unwrap();
    assert!(matches!(
        events.next().await.unwrap().unwrap(),
        Event::Deleted(ref p) if p.metadata.name == "a"
    ));
}

#[tokio::test]
async fn reset_connection_resumes_without_relisting() {
    let store = MemoryStore::default();
    let api = pods(&store);
    let mut events = Box::pin(watcher(api.clone(), config()));
    assert!(matches!(
        events.next().await.unwrap().unwrap(),
        Event::Restarted(..)
    ));

    // Force the watch open before resetting it.
    api.create(&Pod::new("default", "a")).await.unwrap();
    assert!(matches!(events.next().await.unwrap().unwrap(), Event::Applied(_)));

    store.reset_watches();
    api.create(&Pod::new("default", "b")).await.unwrap();

    assert!(events.next().await.unwrap().is_err());
    // Resumed from the last seen version: "b" arrives as an ordinary event.
    assert!(matches!(
        events.next().await.unwrap().unwrap(),
        Event::Applied(ref p) if p.metadata.name == "b"
    ));
}

#[tokio::test]
async fn compaction_forces_a_relist() {
    let store = MemoryStore::default();
    let api = pods(&store);
    api.create(&Pod::new("default", "a")).await.unwrap();

    let mut events = Box::pin(watcher(api.clone(), config()));
    assert!(matches!(
        events.next().await.unwrap().unwrap(),
        Event::Restarted(..)
    ));

    // Changes land and are compacted away before the watch is opened.
    api.create(&Pod::new("default", "b")).await.unwrap();
    api.create(&Pod::new("default", "c")).await.unwrap();
    store.compact().await;

    let err = events.next().await.unwrap().unwrap_err();
    assert!(err.is_gone());

    match events.next().await.unwrap().unwrap() {
        Event::Restarted(items, version) => {
            assert_eq!(names(&items), vec!["a", "b", "c"]);
            assert_eq!(version, store.revision().await);
        }
        other => panic!("expected relist, got {other:?}"),
    }
}
