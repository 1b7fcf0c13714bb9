use std::collections::VecDeque;
use std::future::Future;
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use crate::error::{EnqueueError, FailureReason, StoreError};
use crate::repository::RepositoryConfig;
use crate::store::Store;
use crate::types::{DeadLetterEntry, DispatchItem, ItemId, SubscriptionSet, SubscriptionSetId};

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

#[cfg(feature = "tracing")]
fn trace_event(message: &'static str) {
    tracing::info!(message);
}

#[cfg(not(feature = "tracing"))]
fn trace_event(_message: &'static str) {}

/// Handler errors are opaque to the queue; any error is a failed attempt.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Delivery callback supplied once at repository initialization.
///
/// Invoked serially per queue, concurrently across queues. `Ok(true)`
/// acknowledges delivery; `Ok(false)` and `Err(_)` both take the retry path.
/// Attempts may be duplicated after a crash, so delivery must be idempotent.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn deliver(
        &self,
        set: &SubscriptionSet,
        item: &DispatchItem,
    ) -> Result<bool, HandlerError>;
}

/// The durable, ordered backlog for one subscription set plus its delivery
/// loop.
///
/// Each queue runs a single worker task:
/// - Takes the head item once its backoff deadline has passed
/// - Invokes the handler, bounded by the configured per-attempt timeout
/// - Retries the head in place with exponential backoff, so items behind a
///   failing head are not attempted until it resolves
/// - Dead-letters the head after the retry budget is spent
///
/// An item is never removed from the store before its outcome is recorded;
/// a crash therefore recovers every unacknowledged item.
pub struct DispatchQueue {
    set_id: SubscriptionSetId,
    set: RwLock<SubscriptionSet>,
    items: Mutex<VecDeque<DispatchItem>>,
    next_seq: AtomicU64,
    notify: Notify,
    is_running: AtomicBool,
    degraded: AtomicBool,
    dead_letters: Mutex<VecDeque<DeadLetterEntry>>,
    store: Arc<dyn Store>,
    store_gate: Mutex<()>,
    handler: Arc<dyn DeliveryHandler>,
    config: RepositoryConfig,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DispatchQueue {
    pub(crate) fn new(
        set: SubscriptionSet,
        mut pending: Vec<DispatchItem>,
        store: Arc<dyn Store>,
        handler: Arc<dyn DeliveryHandler>,
        config: RepositoryConfig,
    ) -> Arc<Self> {
        pending.sort_by_key(|item| item.seq);
        let next_seq = pending.last().map(|item| item.seq + 1).unwrap_or(0);

        Arc::new(Self {
            set_id: set.id.clone(),
            set: RwLock::new(set),
            items: Mutex::new(pending.into()),
            next_seq: AtomicU64::new(next_seq),
            notify: Notify::new(),
            is_running: AtomicBool::new(true),
            degraded: AtomicBool::new(false),
            dead_letters: Mutex::new(VecDeque::new()),
            store,
            store_gate: Mutex::new(()),
            handler,
            config,
            worker: Mutex::new(None),
        })
    }

    pub(crate) async fn start(self: &Arc<Self>) {
        let handle = tokio::spawn(delivery_loop(self.clone()));
        *self.worker.lock().await = Some(handle);
    }

    /// Append an item to the tail of the queue.
    ///
    /// The item is durably persisted *before* this call returns; a store
    /// write that cannot be completed within the retry policy yields
    /// `EnqueueError::Store` and the item is not queued.
    pub async fn enqueue(&self, mut item: DispatchItem) -> Result<(), EnqueueError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(EnqueueError::Shutdown);
        }

        // Sequence assignment, the durable write, and the append happen
        // under one gate: concurrent enqueues land in the deque in sequence
        // order, and writes for this set never interleave.
        let _gate = self.store_gate.lock().await;
        item.seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        item.attempt = 0;
        item.not_before_ms = 0;

        let written =
            with_store_retry(&self.config, || self.store.upsert_item(&self.set_id, &item)).await;
        if let Err(err) = written {
            self.mark_degraded();
            return Err(err.into());
        }

        self.items.lock().await.push_back(item);
        metric_inc("pubsub.enqueue.accepted");
        self.notify.notify_one();
        Ok(())
    }

    /// The subscription set this queue belongs to.
    pub async fn subscription_set(&self) -> SubscriptionSet {
        self.set.read().await.clone()
    }

    /// Number of pending items, including one currently in flight.
    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// True once a store write has exhausted its retry budget. The queue
    /// keeps delivering; the persisted mirror may lag behind.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Snapshot of dead-lettered items, oldest first.
    pub async fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.dead_letters.lock().await.iter().cloned().collect()
    }

    /// Re-enqueue every dead-lettered item with a fresh retry budget.
    ///
    /// Returns the number of items replayed. On a store failure the
    /// unreplayed remainder stays in the dead-letter ring.
    pub async fn replay_dead_letters(&self) -> Result<usize, EnqueueError> {
        let entries: Vec<DeadLetterEntry> = {
            let mut guard = self.dead_letters.lock().await;
            guard.drain(..).collect()
        };

        let mut replayed = 0usize;
        for index in 0..entries.len() {
            let mut item = entries[index].item.clone();
            item.attempt = 0;
            item.not_before_ms = 0;
            if let Err(err) = self.enqueue(item).await {
                let mut guard = self.dead_letters.lock().await;
                for entry in entries.into_iter().skip(index) {
                    guard.push_back(entry);
                }
                return Err(err);
            }
            replayed += 1;
        }
        Ok(replayed)
    }

    pub(crate) async fn update_set(&self, set: SubscriptionSet) {
        *self.set.write().await = set;
    }

    /// Stop the delivery loop. An in-flight attempt gets until `deadline`
    /// to finish, then is aborted; undelivered items stay durably intact.
    pub(crate) async fn stop(&self, deadline: Duration) {
        self.is_running.store(false, Ordering::SeqCst);
        self.notify.notify_one();

        let handle = self.worker.lock().await.take();
        if let Some(mut handle) = handle {
            if timeout(deadline, &mut handle).await.is_err() {
                handle.abort();
                trace_event("pubsub.queue.stop_forced");
                metric_inc("pubsub.queue.stop_forced");
            }
        }
    }

    async fn persist_item(&self, item: &DispatchItem) -> Result<(), StoreError> {
        let _gate = self.store_gate.lock().await;
        let result =
            with_store_retry(&self.config, || self.store.upsert_item(&self.set_id, item)).await;
        if result.is_err() {
            self.mark_degraded();
        }
        result
    }

    async fn remove_item(&self, item_id: &ItemId) -> Result<(), StoreError> {
        let _gate = self.store_gate.lock().await;
        let result =
            with_store_retry(&self.config, || self.store.delete_item(&self.set_id, item_id))
                .await;
        if result.is_err() {
            self.mark_degraded();
        }
        result
    }

    fn mark_degraded(&self) {
        self.degraded.store(true, Ordering::SeqCst);
        trace_event("pubsub.store.degraded");
        metric_inc("pubsub.store.degraded");
    }

    async fn push_dead_letter(&self, item: DispatchItem, reason: FailureReason) {
        let entry = DeadLetterEntry {
            set_id: self.set_id.clone(),
            item,
            reason,
            created_at_secs: now_secs(),
        };

        let mut guard = self.dead_letters.lock().await;
        guard.push_back(entry);
        while guard.len() > self.config.dead_letter_capacity {
            guard.pop_front();
        }
    }
}

/// Outcome of one handler invocation, normalized across value, error, and
/// timeout results.
enum AttemptOutcome {
    Delivered,
    Failed(FailureReason),
}

/// Main delivery loop, one task per queue.
///
/// The loop:
/// - Sleeps while the queue is empty or the head is in backoff
/// - Never holds the item lock across a handler await
/// - Retries the head in place, preserving order across items
async fn delivery_loop(queue: Arc<DispatchQueue>) {
    loop {
        if !queue.is_running() {
            break;
        }

        let head = { queue.items.lock().await.front().cloned() };
        let Some(item) = head else {
            let notified = queue.notify.notified();
            if !queue.is_running() {
                break;
            }
            notified.await;
            continue;
        };

        let now = now_ms();
        if item.not_before_ms > now {
            let wait = Duration::from_millis(item.not_before_ms - now);
            tokio::select! {
                _ = queue.notify.notified() => {}
                _ = sleep(wait) => {}
            }
            continue;
        }

        let outcome = attempt_delivery(&queue, &item).await;

        match outcome {
            AttemptOutcome::Delivered => {
                // Record the outcome durably before dropping the item from
                // memory. If the delete cannot be persisted the queue is
                // degraded and the stale store row may be re-delivered after
                // a restart, which at-least-once permits.
                let _ = queue.remove_item(&item.id).await;
                queue.items.lock().await.pop_front();
                metric_inc("pubsub.delivery.delivered");
                trace_event("pubsub.delivery.delivered");
            }
            AttemptOutcome::Failed(reason) => {
                match reason {
                    FailureReason::Rejected => metric_inc("pubsub.delivery.rejected"),
                    FailureReason::HandlerError => metric_inc("pubsub.delivery.handler_error"),
                    FailureReason::Timeout => metric_inc("pubsub.delivery.timeout"),
                    FailureReason::MaxRetriesExceeded => {}
                }

                let attempt = item.attempt + 1;
                if attempt > queue.config.max_retries {
                    let _ = queue.remove_item(&item.id).await;
                    let mut dropped = queue
                        .items
                        .lock()
                        .await
                        .pop_front()
                        .unwrap_or_else(|| item.clone());
                    dropped.attempt = attempt;
                    queue
                        .push_dead_letter(dropped, FailureReason::MaxRetriesExceeded)
                        .await;
                    metric_inc("pubsub.delivery.dead_lettered");
                    trace_event("pubsub.delivery.dead_lettered");
                } else {
                    let delay = retry_delay(
                        attempt,
                        queue.config.retry_base_ms,
                        queue.config.retry_max_ms,
                    ) + jitter_delay(queue.config.retry_jitter_ms);

                    let mut updated = item.clone();
                    updated.attempt = attempt;
                    updated.not_before_ms = now_ms() + delay.as_millis() as u64;

                    let _ = queue.persist_item(&updated).await;

                    if let Some(head) = queue.items.lock().await.front_mut() {
                        *head = updated;
                    }
                    metric_inc("pubsub.delivery.retry_scheduled");
                    trace_event("pubsub.delivery.retry_scheduled");
                }
            }
        }
    }
}

async fn attempt_delivery(queue: &DispatchQueue, item: &DispatchItem) -> AttemptOutcome {
    let set = queue.set.read().await.clone();

    let result = match queue.config.attempt_timeout_ms {
        Some(ms) => {
            match timeout(Duration::from_millis(ms), queue.handler.deliver(&set, item)).await {
                Ok(result) => result,
                Err(_) => return AttemptOutcome::Failed(FailureReason::Timeout),
            }
        }
        None => queue.handler.deliver(&set, item).await,
    };

    match result {
        Ok(true) => AttemptOutcome::Delivered,
        Ok(false) => AttemptOutcome::Failed(FailureReason::Rejected),
        Err(_) => AttemptOutcome::Failed(FailureReason::HandlerError),
    }
}

/// Bounded exponential-backoff retry for store writes. Steady-state
/// persistence failures are absorbed here; only exhaustion escapes.
pub(crate) async fn with_store_retry<F, Fut>(
    config: &RepositoryConfig,
    mut op: F,
) -> Result<(), StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), StoreError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(()) => return Ok(()),
            Err(err) => {
                attempt += 1;
                if attempt > config.store_retry_attempts {
                    return Err(err);
                }
                sleep(retry_delay(
                    attempt,
                    config.store_retry_base_ms,
                    config.store_retry_base_ms.saturating_mul(16),
                ))
                .await;
            }
        }
    }
}

fn retry_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let base = base_ms.max(1);
    let max = max_ms.max(base);
    let pow = 2u64.saturating_pow(attempt.saturating_sub(1));
    Duration::from_millis(base.saturating_mul(pow).min(max))
}

fn jitter_delay(jitter_ms: u64) -> Duration {
    if jitter_ms == 0 {
        return Duration::from_millis(0);
    }
    Duration::from_millis(fastrand::u64(0..=jitter_ms))
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_doubles_per_attempt() {
        assert_eq!(retry_delay(1, 100, 5_000), Duration::from_millis(100));
        assert_eq!(retry_delay(2, 100, 5_000), Duration::from_millis(200));
        assert_eq!(retry_delay(3, 100, 5_000), Duration::from_millis(400));
        assert_eq!(retry_delay(4, 100, 5_000), Duration::from_millis(800));
    }

    #[test]
    fn retry_delay_respects_cap() {
        assert_eq!(retry_delay(10, 100, 5_000), Duration::from_millis(5_000));
        assert_eq!(retry_delay(63, 100, 5_000), Duration::from_millis(5_000));
    }

    #[test]
    fn retry_delay_survives_degenerate_config() {
        assert_eq!(retry_delay(1, 0, 0), Duration::from_millis(1));
        assert_eq!(retry_delay(5, 100, 10), Duration::from_millis(100));
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        assert_eq!(jitter_delay(0), Duration::from_millis(0));
    }

    #[test]
    fn jitter_stays_within_bound() {
        for _ in 0..64 {
            assert!(jitter_delay(50) <= Duration::from_millis(50));
        }
    }
}
