//! Optimistic concurrency and finalizer behavior through the typed client.

use std::sync::Arc;
use std::time::Duration;

use keel_api::{Pod, FOREGROUND_DELETION_FINALIZER};
use keel_id::ResourceVersion;
use keel_store::{Api, BackoffPolicy, DeleteOutcome, MemoryStore, ObjectStore, Preconditions};

fn pods(store: &MemoryStore) -> Api<Pod> {
    let store: Arc<dyn ObjectStore> = Arc::new(store.clone());
    Api::namespaced(store, "default").with_actor("tests")
}

#[tokio::test]
async fn concurrent_updates_from_same_version_conflict() {
    let store = MemoryStore::default();
    let api = pods(&store);

    let mut pod = api.create(&Pod::new("default", "web")).await.unwrap();
    for priority in 1..=4 {
        pod.spec.priority = priority;
        pod = api.update(&pod).await.unwrap();
    }
    assert_eq!(pod.metadata.resource_version, Some(ResourceVersion::new(5)));

    let mut first = pod.clone();
    first.spec.priority = 10;
    let mut second = pod.clone();
    second.spec.priority = 20;

    let api_a = api.clone();
    let api_b = api.clone();
    let (a, b) = tokio::join!(
        tokio::spawn(async move { api_a.update(&first).await }),
        tokio::spawn(async move { api_b.update(&second).await }),
    );
    let results = [a.unwrap(), b.unwrap()];

    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    let conflicts = results
        .iter()
        .filter(|r| r.as_ref().is_err_and(|e| e.is_conflict()))
        .count();
    assert_eq!(winners.len(), 1);
    assert_eq!(conflicts, 1);
    assert_eq!(
        winners[0].metadata.resource_version,
        Some(ResourceVersion::new(6))
    );

    let stored = api.get("web").await.unwrap();
    assert_eq!(stored.spec.priority, winners[0].spec.priority);
}

#[tokio::test]
async fn update_storm_loses_no_increment() {
    let store = MemoryStore::default();
    let api = pods(&store);
    api.create(&Pod::new("default", "counter")).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let api = api.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let mut pod = api.get("counter").await.unwrap();
                pod.spec.priority += 1;
                match api.update(&pod).await {
                    Ok(_) => break,
                    Err(err) if err.is_conflict() => tokio::task::yield_now().await,
                    Err(err) => panic!("unexpected error: {err}"),
                }
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(api.get("counter").await.unwrap().spec.priority, 16);
}

#[tokio::test]
async fn finalizer_defers_physical_removal() {
    let store = MemoryStore::default();
    let api = pods(&store);

    let mut pod = Pod::new("default", "web");
    pod.metadata.finalizers.push("example.com/cleanup".to_string());
    api.create(&pod).await.unwrap();

    let outcome = api.delete("web", &Preconditions::default()).await.unwrap();
    let pending = match outcome {
        DeleteOutcome::Pending(pod) => pod,
        DeleteOutcome::Deleted(_) => panic!("object with finalizer was removed"),
    };
    assert!(pending.metadata.is_deleting());

    let listed = api.list(None).await.unwrap();
    assert_eq!(listed.items.len(), 1);
    assert!(listed.items[0].metadata.deletion_timestamp.is_some());

    // A second delete is idempotent.
    let again = api.delete("web", &Preconditions::default()).await.unwrap();
    assert!(again.is_pending());

    let mut current = api.get("web").await.unwrap();
    current.metadata.remove_finalizer("example.com/cleanup");
    api.update(&current).await.unwrap();

    assert!(api.get_opt("web").await.unwrap().is_none());
    assert!(api.list(None).await.unwrap().items.is_empty());
}

#[tokio::test]
async fn foreground_finalizer_is_an_ordinary_finalizer_to_the_store() {
    let store = MemoryStore::default();
    let api = pods(&store);

    let mut pod = Pod::new("default", "web");
    pod.metadata.add_finalizer(FOREGROUND_DELETION_FINALIZER);
    let created = api.create(&pod).await.unwrap();

    assert!(api.delete_object(&created).await.unwrap().is_pending());
}

#[tokio::test]
async fn recreated_object_gets_a_new_uid() {
    let store = MemoryStore::default();
    let api = pods(&store);

    let first = api.create(&Pod::new("default", "web")).await.unwrap();
    api.delete_object(&first).await.unwrap();
    let second = api.create(&Pod::new("default", "web")).await.unwrap();

    assert_ne!(first.metadata.uid, second.metadata.uid);
    // A delete aimed at the old incarnation must not touch the new one.
    let err = api.delete_object(&first).await.unwrap_err();
    assert!(err.is_conflict());
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried_by_the_client() {
    let store = MemoryStore::default();
    let api = pods(&store).with_retry(
        5,
        BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(100)),
    );

    store.inject_failures(3).await;
    api.create(&Pod::new("default", "web")).await.unwrap();

    store.inject_failures(5).await;
    let err = api.get("web").await.unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn namespace_mismatch_is_rejected() {
    let store = MemoryStore::default();
    let api = pods(&store);
    let err = api.create(&Pod::new("prod", "web")).await.unwrap_err();
    assert!(matches!(err, keel_store::StoreError::Invalid(_)));
}
