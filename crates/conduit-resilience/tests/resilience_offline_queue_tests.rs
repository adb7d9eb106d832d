use async_trait::async_trait;
use conduit_core::{ConduitError, ConduitResult, WriteRequest};
use conduit_resilience::{FileStateStore, InMemoryStateStore, OfflineQueue, OfflineQueueConfig, StateStore};
use mockall::mock;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;

mock! {
    pub Store {}

    #[async_trait]
    impl StateStore for Store {
        async fn get_state(&self, key: &str) -> ConduitResult<Option<Value>>;
        async fn set_state(&self, key: &str, state: Value) -> ConduitResult<()>;
        async fn delete_state(&self, key: &str) -> ConduitResult<()>;
    }
}

fn watchlist_add(symbol: &str) -> WriteRequest {
    WriteRequest::new("watchlist.add", symbol, json!({ "list": "core" }))
}

#[tokio::test]
async fn test_restart_replays_in_original_order() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(dir.path()));

    {
        let queue = OfflineQueue::load(OfflineQueueConfig::default(), store.clone()).await.unwrap();
        for symbol in ["AAPL", "MSFT", "NVDA"] {
            queue.enqueue(watchlist_add(symbol)).await.unwrap();
        }
    }

    // Simulated restart: a fresh store and queue over the same directory
    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(dir.path()));
    let queue = OfflineQueue::load(OfflineQueueConfig::default(), store.clone()).await.unwrap();
    assert_eq!(queue.len().await, 3);

    let applied = Arc::new(Mutex::new(Vec::new()));
    let report = queue
        .process_queue(|request| {
            let applied = applied.clone();
            async move {
                applied.lock().await.push(request.target.clone());
                Ok(json!({ "applied": request.target }))
            }
        })
        .await
        .unwrap();

    assert_eq!(*applied.lock().await, vec!["AAPL", "MSFT", "NVDA"]);
    assert_eq!(report.replayed.len(), 3);
    assert!(queue.is_empty().await);
    assert_eq!(store.get_state("conduit:offline-queue").await.unwrap(), Some(json!([])));
}

#[tokio::test]
async fn test_item_dropped_after_three_failures() {
    let store = Arc::new(InMemoryStateStore::new());
    let queue = OfflineQueue::load(OfflineQueueConfig::default(), store.clone()).await.unwrap();
    let doomed = queue.enqueue(watchlist_add("DOOMED")).await.unwrap();
    queue.enqueue(watchlist_add("LATER")).await.unwrap();

    let replay = |request: WriteRequest| async move {
        if request.target == "DOOMED" {
            Err(ConduitError::upstream("stale watchlist version"))
        } else {
            Err(ConduitError::upstream("list is full"))
        }
    };

    for pass in 1..=2 {
        let report = queue.process_queue(replay).await.unwrap();
        assert_eq!(report.retained.len(), 2, "pass {}", pass);
        let persisted = store.get_state("conduit:offline-queue").await.unwrap().unwrap();
        assert_eq!(persisted[0]["attempts"], pass);
    }

    let report = queue.process_queue(replay).await.unwrap();
    assert_eq!(report.dropped.len(), 2);
    assert_eq!(report.dropped[0].id, doomed.id);
    assert_eq!(report.dropped[0].attempts, 3);

    let persisted = store.get_state("conduit:offline-queue").await.unwrap().unwrap();
    assert_eq!(persisted, json!([]));

    let stats = queue.stats().await;
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.dropped_total, 2);
}

#[tokio::test]
async fn test_partial_failure_keeps_only_failed_item() {
    let store = Arc::new(InMemoryStateStore::new());
    let queue = OfflineQueue::load(OfflineQueueConfig::default(), store.clone()).await.unwrap();
    queue.enqueue(watchlist_add("AAPL")).await.unwrap();
    let flaky = queue.enqueue(watchlist_add("FLAKY")).await.unwrap();
    queue.enqueue(watchlist_add("MSFT")).await.unwrap();

    let report = queue
        .process_queue(|request| async move {
            if request.target == "FLAKY" {
                Err(ConduitError::upstream("duplicate symbol"))
            } else {
                Ok(json!(null))
            }
        })
        .await
        .unwrap();

    assert_eq!(report.replayed.len(), 2);
    assert_eq!(report.retained, vec![flaky.id.clone()]);

    // Reload sees the retained item with its attempt recorded
    let reloaded = OfflineQueue::load(OfflineQueueConfig::default(), store).await.unwrap();
    let items = reloaded.items().await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].id, flaky.id);
    assert_eq!(items[0].attempts, 1);
}

#[tokio::test]
async fn test_enqueue_rolls_back_when_persist_fails() {
    let mut store = MockStore::new();
    store.expect_get_state().returning(|_| Ok(None));
    store
        .expect_set_state()
        .times(1)
        .returning(|_, _| Err(ConduitError::StateStore("disk full".to_string())));

    let queue = OfflineQueue::load(OfflineQueueConfig::default(), Arc::new(store)).await.unwrap();
    let result = queue.enqueue(watchlist_add("AAPL")).await;

    assert_eq!(result.unwrap_err(), ConduitError::StateStore("disk full".to_string()));
    assert!(queue.is_empty().await);
}

#[tokio::test]
async fn test_custom_storage_key_and_attempt_bound() {
    let store = Arc::new(InMemoryStateStore::new());
    let config = OfflineQueueConfig {
        storage_key: "tests:writes".to_string(),
        max_attempts: 1,
    };
    let queue = OfflineQueue::load(config, store.clone()).await.unwrap();
    queue.enqueue(watchlist_add("AAPL")).await.unwrap();

    let report = queue
        .process_queue(|_| async { Err(ConduitError::upstream("connection reset")) })
        .await
        .unwrap();

    assert_eq!(report.dropped.len(), 1);
    assert_eq!(store.get_state("tests:writes").await.unwrap(), Some(json!([])));
    assert!(store.get_state("conduit:offline-queue").await.unwrap().is_none());
}

#[tokio::test]
async fn test_unreachable_upstream_stops_pass_in_order() {
    let store = Arc::new(InMemoryStateStore::new());
    let queue = OfflineQueue::load(OfflineQueueConfig::default(), store.clone()).await.unwrap();
    let first = queue.enqueue(watchlist_add("AAPL")).await.unwrap();
    let second = queue.enqueue(watchlist_add("MSFT")).await.unwrap();
    let third = queue.enqueue(watchlist_add("NVDA")).await.unwrap();

    let attempted = Arc::new(Mutex::new(Vec::new()));
    let report = queue
        .process_queue(|request| {
            let attempted = attempted.clone();
            async move {
                attempted.lock().await.push(request.target.clone());
                Err(ConduitError::upstream("connection refused"))
            }
        })
        .await
        .unwrap();

    assert_eq!(*attempted.lock().await, vec!["AAPL"]);
    assert_eq!(report.retained, vec![first.id.clone()]);
    assert_eq!(report.skipped, vec![second.id.clone(), third.id.clone()]);

    let items = queue.items().await;
    let attempts: Vec<u32> = items.iter().map(|item| item.attempts).collect();
    assert_eq!(attempts, vec![1, 0, 0]);
    assert_eq!(items[0].id, first.id);
}
