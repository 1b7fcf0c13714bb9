use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use pubsub_dispatch::{
    DeliveryHandler, DispatchItem, DispatchQueueRepository, EnqueueError, FailureReason,
    HandlerError, InMemoryStore, ItemId, RepositoryConfig, Store, StoreError, SubscriptionSet,
    SubscriptionSetId,
};

/// Fails each item the scripted number of times, then succeeds.
/// Records every attempt it observes with a timestamp.
struct ScriptedHandler {
    fail_counts: Mutex<HashMap<String, u32>>,
    log: Mutex<Vec<(String, Instant)>>,
}

impl ScriptedHandler {
    fn new(fail_counts: &[(&str, u32)]) -> Arc<Self> {
        Arc::new(Self {
            fail_counts: Mutex::new(
                fail_counts
                    .iter()
                    .map(|(id, n)| (id.to_string(), *n))
                    .collect(),
            ),
            log: Mutex::new(Vec::new()),
        })
    }

    async fn attempts(&self) -> Vec<(String, Instant)> {
        self.log.lock().await.clone()
    }

    async fn wait_for_attempts(&self, count: usize) {
        for _ in 0..500 {
            if self.log.lock().await.len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {} delivery attempts", count);
    }
}

#[async_trait]
impl DeliveryHandler for ScriptedHandler {
    async fn deliver(
        &self,
        _set: &SubscriptionSet,
        item: &DispatchItem,
    ) -> Result<bool, HandlerError> {
        self.log
            .lock()
            .await
            .push((item.id.0.clone(), Instant::now()));

        let mut counts = self.fail_counts.lock().await;
        let remaining = counts.entry(item.id.0.clone()).or_insert(0);
        if *remaining > 0 {
            *remaining -= 1;
            Ok(false)
        } else {
            Ok(true)
        }
    }
}

/// Never completes a delivery. Used to keep items pending.
struct HangingHandler;

#[async_trait]
impl DeliveryHandler for HangingHandler {
    async fn deliver(
        &self,
        _set: &SubscriptionSet,
        _item: &DispatchItem,
    ) -> Result<bool, HandlerError> {
        std::future::pending().await
    }
}

fn fast_config() -> RepositoryConfig {
    RepositoryConfig {
        max_retries: 3,
        retry_base_ms: 20,
        retry_max_ms: 200,
        retry_jitter_ms: 0,
        attempt_timeout_ms: None,
        store_retry_base_ms: 5,
        shutdown_timeout_ms: 200,
        ..Default::default()
    }
}

#[tokio::test]
async fn head_of_line_retry_preserves_enqueue_order() {
    let store = Arc::new(InMemoryStore::new());
    let repository = DispatchQueueRepository::new(store, fast_config());

    // B fails twice, then succeeds; A and C succeed immediately.
    let handler = ScriptedHandler::new(&[("b", 2)]);
    repository.initialize(handler.clone()).await.unwrap();

    let set = SubscriptionSet::new("s1", "dest");
    repository.register_or_update(set.clone()).await.unwrap();

    let queue = repository.get(&set).await.unwrap();
    queue.enqueue(DispatchItem::new("a", b"1".to_vec())).await.unwrap();
    queue.enqueue(DispatchItem::new("b", b"2".to_vec())).await.unwrap();
    queue.enqueue(DispatchItem::new("c", b"3".to_vec())).await.unwrap();

    // A, B(fail), B(fail), B(ok), C: C is held behind B until B resolves.
    handler.wait_for_attempts(5).await;
    let observed: Vec<String> = handler.attempts().await.into_iter().map(|(id, _)| id).collect();
    assert_eq!(observed, vec!["a", "b", "b", "b", "c"]);

    assert!(queue.dead_letters().await.is_empty());
    repository.shutdown().await;
}

#[tokio::test]
async fn failing_item_dead_letters_after_retry_budget() {
    let store = Arc::new(InMemoryStore::new());
    let config = RepositoryConfig {
        max_retries: 2,
        retry_base_ms: 40,
        retry_max_ms: 1_000,
        ..fast_config()
    };
    let repository = DispatchQueueRepository::new(store.clone(), config);

    let handler = ScriptedHandler::new(&[("x", u32::MAX)]);
    repository.initialize(handler.clone()).await.unwrap();

    let set = SubscriptionSet::new("s1", "dest");
    repository.register_or_update(set.clone()).await.unwrap();

    let queue = repository.get(&set).await.unwrap();
    queue.enqueue(DispatchItem::new("x", b"1".to_vec())).await.unwrap();

    // 1 initial attempt + 2 retries, then the item is dropped.
    handler.wait_for_attempts(3).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let attempts = handler.attempts().await;
    assert_eq!(attempts.len(), 3);

    // Backoff doubles per attempt: inter-attempt gaps never shrink.
    let gap1 = attempts[1].1 - attempts[0].1;
    let gap2 = attempts[2].1 - attempts[1].1;
    assert!(gap1 >= Duration::from_millis(40), "first gap {:?}", gap1);
    assert!(gap2 >= gap1, "gaps {:?} then {:?}", gap1, gap2);

    let dead = queue.dead_letters().await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].item.id.0, "x");
    assert_eq!(dead[0].item.attempt, 3);
    assert_eq!(dead[0].reason, FailureReason::MaxRetriesExceeded);

    // The outcome is durably recorded: nothing left to recover.
    assert!(queue.is_empty().await);
    let persisted = store.load_all().await.unwrap();
    assert!(persisted.iter().all(|(_, items)| items.is_empty()));

    repository.shutdown().await;
}

#[tokio::test]
async fn enqueue_persists_before_returning() {
    let store = Arc::new(InMemoryStore::new());
    let repository = DispatchQueueRepository::new(store.clone(), fast_config());
    repository.initialize(Arc::new(HangingHandler)).await.unwrap();

    let set = SubscriptionSet::new("s1", "dest");
    repository.register_or_update(set.clone()).await.unwrap();

    let queue = repository.get(&set).await.unwrap();
    queue.enqueue(DispatchItem::new("a", b"1".to_vec())).await.unwrap();

    // The write precedes acknowledgment to the caller.
    let persisted = store.load_all().await.unwrap();
    let (_, items) = persisted
        .iter()
        .find(|(s, _)| s.id == set.id)
        .expect("set record persisted");
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].id.0, "a");

    repository.shutdown().await;
}

#[tokio::test]
async fn attempt_timeout_feeds_retry_path() {
    let store = Arc::new(InMemoryStore::new());
    let config = RepositoryConfig {
        max_retries: 1,
        attempt_timeout_ms: Some(40),
        ..fast_config()
    };
    let repository = DispatchQueueRepository::new(store, config);

    struct SlowHandler {
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl DeliveryHandler for SlowHandler {
        async fn deliver(
            &self,
            _set: &SubscriptionSet,
            _item: &DispatchItem,
        ) -> Result<bool, HandlerError> {
            *self.calls.lock().await += 1;
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(true)
        }
    }

    let handler = Arc::new(SlowHandler {
        calls: Mutex::new(0),
    });
    repository.initialize(handler.clone()).await.unwrap();

    let set = SubscriptionSet::new("s1", "dest");
    repository.register_or_update(set.clone()).await.unwrap();

    let queue = repository.get(&set).await.unwrap();
    queue.enqueue(DispatchItem::new("slow", b"1".to_vec())).await.unwrap();

    // Both attempts time out; the timeout is a failure, so the retry path
    // runs once before the item is dropped.
    for _ in 0..500 {
        if !queue.dead_letters().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(*handler.calls.lock().await, 2);
    let dead = queue.dead_letters().await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].reason, FailureReason::MaxRetriesExceeded);

    repository.shutdown().await;
}

#[tokio::test]
async fn handler_error_counts_as_failed_attempt() {
    let store = Arc::new(InMemoryStore::new());
    let config = RepositoryConfig {
        max_retries: 0,
        ..fast_config()
    };
    let repository = DispatchQueueRepository::new(store, config);

    struct ErrHandler;

    #[async_trait]
    impl DeliveryHandler for ErrHandler {
        async fn deliver(
            &self,
            _set: &SubscriptionSet,
            _item: &DispatchItem,
        ) -> Result<bool, HandlerError> {
            Err("boom".into())
        }
    }

    repository.initialize(Arc::new(ErrHandler)).await.unwrap();

    let set = SubscriptionSet::new("s1", "dest");
    repository.register_or_update(set.clone()).await.unwrap();

    let queue = repository.get(&set).await.unwrap();
    queue.enqueue(DispatchItem::new("a", b"1".to_vec())).await.unwrap();

    for _ in 0..500 {
        if !queue.dead_letters().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(queue.dead_letters().await.len(), 1);

    repository.shutdown().await;
}

#[tokio::test]
async fn enqueue_after_queue_removed_is_rejected() {
    let store = Arc::new(InMemoryStore::new());
    let repository = DispatchQueueRepository::new(store, fast_config());
    repository
        .initialize(ScriptedHandler::new(&[]))
        .await
        .unwrap();

    let set = SubscriptionSet::new("s1", "dest");
    repository.register_or_update(set.clone()).await.unwrap();

    // A stale handle from before the delete must not accept new items.
    let queue = repository.get(&set).await.unwrap();
    repository.delete(&set).await.unwrap();

    let err = queue
        .enqueue(DispatchItem::new("late", b"1".to_vec()))
        .await
        .unwrap_err();
    assert!(matches!(err, EnqueueError::Shutdown));

    repository.shutdown().await;
}

/// Accepts set records but refuses every item write.
struct ItemWriteFailingStore {
    inner: InMemoryStore,
}

#[async_trait]
impl Store for ItemWriteFailingStore {
    async fn load_all(&self) -> Result<Vec<(SubscriptionSet, Vec<DispatchItem>)>, StoreError> {
        self.inner.load_all().await
    }

    async fn upsert_set(&self, set: &SubscriptionSet) -> Result<(), StoreError> {
        self.inner.upsert_set(set).await
    }

    async fn delete_set(&self, set_id: &SubscriptionSetId) -> Result<(), StoreError> {
        self.inner.delete_set(set_id).await
    }

    async fn upsert_item(
        &self,
        _set_id: &SubscriptionSetId,
        _item: &DispatchItem,
    ) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("disk full".into()))
    }

    async fn delete_item(
        &self,
        set_id: &SubscriptionSetId,
        item_id: &ItemId,
    ) -> Result<(), StoreError> {
        self.inner.delete_item(set_id, item_id).await
    }
}

#[tokio::test]
async fn exhausted_store_retries_mark_queue_degraded() {
    let store = Arc::new(ItemWriteFailingStore {
        inner: InMemoryStore::new(),
    });
    let config = RepositoryConfig {
        store_retry_attempts: 1,
        store_retry_base_ms: 1,
        ..fast_config()
    };
    let repository = DispatchQueueRepository::new(store, config);

    let handler = ScriptedHandler::new(&[]);
    repository.initialize(handler.clone()).await.unwrap();

    let bad = SubscriptionSet::new("bad", "dest");
    let good = SubscriptionSet::new("good", "dest");
    repository.register_or_update(bad.clone()).await.unwrap();
    repository.register_or_update(good.clone()).await.unwrap();

    // The failed write is surfaced, the item is not queued, and only this
    // queue is marked degraded.
    let bad_queue = repository.get(&bad).await.unwrap();
    let err = bad_queue
        .enqueue(DispatchItem::new("a", b"1".to_vec()))
        .await
        .unwrap_err();
    assert!(matches!(err, EnqueueError::Store(_)));
    assert!(bad_queue.is_empty().await);
    assert!(bad_queue.is_degraded());

    let good_queue = repository.get(&good).await.unwrap();
    assert!(!good_queue.is_degraded());

    repository.shutdown().await;
}
