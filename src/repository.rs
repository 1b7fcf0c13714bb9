use std::collections::HashMap;
use std::sync::{
    Arc, OnceLock,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use tokio::sync::RwLock;

use crate::error::{EnqueueError, RepositoryError};
use crate::queue::{with_store_retry, DeliveryHandler, DispatchQueue};
use crate::store::Store;
use crate::types::{DeadLetterEntry, SubscriptionSet, SubscriptionSetId};

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

#[derive(Debug, Clone)]
pub struct RepositoryConfig {
    /// Retries per item after the first failed attempt; an item makes at
    /// most `1 + max_retries` attempts before dead-lettering.
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub retry_jitter_ms: u64,

    /// Per-attempt handler timeout. `None` waits indefinitely.
    pub attempt_timeout_ms: Option<u64>,

    /// Dead-letter ring capacity per queue, oldest dropped first.
    pub dead_letter_capacity: usize,

    /// Retries per store write before the queue is marked degraded.
    pub store_retry_attempts: u32,
    pub store_retry_base_ms: u64,

    /// Grace each queue gets to finish its in-flight attempt on stop.
    pub shutdown_timeout_ms: u64,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_ms: 100,
            retry_max_ms: 5_000,
            retry_jitter_ms: 50,
            attempt_timeout_ms: Some(30_000),
            dead_letter_capacity: 10_000,
            store_retry_attempts: 3,
            store_retry_base_ms: 50,
            shutdown_timeout_ms: 5_000,
        }
    }
}

/// The authoritative mapping from subscription set to dispatch queue.
///
/// The repository owns queue lifecycle end to end: recovery from the store
/// at `initialize`, creation on registration, teardown on deletion, and a
/// final `shutdown`. No two queues ever exist for the same identity, and a
/// lookup never observes a half-created or half-destroyed queue.
///
/// All operations besides `new` require `initialize` to have completed.
pub struct DispatchQueueRepository {
    queues: RwLock<HashMap<SubscriptionSetId, Arc<DispatchQueue>>>,
    handler: OnceLock<Arc<dyn DeliveryHandler>>,
    initialized: AtomicBool,
    is_running: AtomicBool,
    store: Arc<dyn Store>,
    config: RepositoryConfig,
}

impl DispatchQueueRepository {
    /// Wire up the repository. No I/O happens until `initialize`.
    pub fn new(store: Arc<dyn Store>, config: RepositoryConfig) -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
            handler: OnceLock::new(),
            initialized: AtomicBool::new(false),
            is_running: AtomicBool::new(true),
            store,
            config,
        }
    }

    /// Recover persisted state and start delivery.
    ///
    /// Loads every persisted subscription set with its pending items, builds
    /// one queue per set bound to `handler`, starts each delivery loop, and
    /// returns the recovered sets so the caller can rebuild its routing
    /// index.
    ///
    /// Callable exactly once. A store failure here is fatal: the repository
    /// stays uninitialized and the caller decides whether to abort startup
    /// or retry with a fresh repository.
    pub async fn initialize(
        &self,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<Vec<SubscriptionSet>, RepositoryError> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Err(RepositoryError::AlreadyInitialized);
        }

        let recovered = match self.store.load_all().await {
            Ok(recovered) => recovered,
            Err(err) => {
                self.initialized.store(false, Ordering::SeqCst);
                metric_inc("pubsub.repository.initialize_failed");
                return Err(RepositoryError::Store(err));
            }
        };

        let _ = self.handler.set(handler.clone());

        let mut sets = Vec::with_capacity(recovered.len());
        let mut guard = self.queues.write().await;
        for (set, pending) in recovered {
            let queue = DispatchQueue::new(
                set.clone(),
                pending,
                self.store.clone(),
                handler.clone(),
                self.config.clone(),
            );
            queue.start().await;
            guard.insert(set.id.clone(), queue);
            sets.push(set);
        }
        drop(guard);

        trace_event("pubsub.repository.initialized");
        metric_inc("pubsub.repository.initialized");
        Ok(sets)
    }

    /// Register a new subscription set or apply a metadata update.
    ///
    /// A new identity gets an empty queue whose record is durably written
    /// before the queue becomes visible. An existing identity with a
    /// different version has its record replaced and its queue's metadata
    /// swapped in place; pending items are preserved because queues are
    /// keyed by subscriber identity, not by version or destination. An
    /// unchanged version is a no-op.
    pub async fn register_or_update(&self, set: SubscriptionSet) -> Result<(), RepositoryError> {
        self.check_ready()?;

        let mut guard = self.queues.write().await;
        if let Some(queue) = guard.get(&set.id) {
            if queue.subscription_set().await.version == set.version {
                return Ok(());
            }
            with_store_retry(&self.config, || self.store.upsert_set(&set)).await?;
            queue.update_set(set).await;
            metric_inc("pubsub.repository.updated");
            return Ok(());
        }

        with_store_retry(&self.config, || self.store.upsert_set(&set)).await?;

        let handler = self
            .handler
            .get()
            .ok_or(RepositoryError::NotInitialized)?
            .clone();
        let queue = DispatchQueue::new(
            set.clone(),
            Vec::new(),
            self.store.clone(),
            handler,
            self.config.clone(),
        );
        queue.start().await;
        guard.insert(set.id, queue);
        metric_inc("pubsub.repository.registered");
        Ok(())
    }

    /// Remove a subscription set: stop its queue and durably purge its
    /// record together with all pending items. Unknown identities are a
    /// no-op.
    pub async fn delete(&self, set: &SubscriptionSet) -> Result<(), RepositoryError> {
        self.check_ready()?;

        let queue = { self.queues.write().await.remove(&set.id) };
        let Some(queue) = queue else {
            return Ok(());
        };

        queue
            .stop(Duration::from_millis(self.config.shutdown_timeout_ms))
            .await;
        with_store_retry(&self.config, || self.store.delete_set(&set.id)).await?;
        metric_inc("pubsub.repository.deleted");
        Ok(())
    }

    /// Look up the queue for a subscription set. `None` means the set is
    /// not registered; callers must register before enqueueing.
    pub async fn get(&self, set: &SubscriptionSet) -> Option<Arc<DispatchQueue>> {
        self.queues.read().await.get(&set.id).cloned()
    }

    /// Snapshot of the currently registered queues.
    ///
    /// Consistency under concurrent registration or deletion is
    /// best-effort, but every returned queue is fully constructed.
    pub async fn queues(&self) -> Vec<Arc<DispatchQueue>> {
        self.queues.read().await.values().cloned().collect()
    }

    /// Aggregated dead-letter snapshot across every queue.
    pub async fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        let mut entries = Vec::new();
        for queue in self.queues().await {
            entries.extend(queue.dead_letters().await);
        }
        entries
    }

    /// Re-enqueue a queue's dead-lettered items with a fresh retry budget.
    /// Returns how many were replayed; an unregistered identity replays
    /// nothing.
    pub async fn replay_dead_letters(
        &self,
        set: &SubscriptionSet,
    ) -> Result<usize, RepositoryError> {
        self.check_ready()?;

        let Some(queue) = self.get(set).await else {
            return Ok(0);
        };

        queue.replay_dead_letters().await.map_err(|err| match err {
            EnqueueError::Shutdown => RepositoryError::Shutdown,
            EnqueueError::Store(err) => RepositoryError::Store(err),
        })
    }

    /// Stop every delivery loop and release the queue map.
    ///
    /// Each queue gets `shutdown_timeout_ms` to finish its in-flight
    /// attempt, then is aborted; a forced stop is logged, never returned as
    /// an error. Undelivered items stay durably intact for the next
    /// `initialize`.
    pub async fn shutdown(&self) {
        self.is_running.store(false, Ordering::SeqCst);

        let queues: Vec<Arc<DispatchQueue>> =
            { self.queues.write().await.drain().map(|(_, q)| q).collect() };

        let deadline = Duration::from_millis(self.config.shutdown_timeout_ms);
        for queue in queues {
            queue.stop(deadline).await;
        }

        trace_event("pubsub.repository.shutdown");
        metric_inc("pubsub.repository.shutdown");
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    fn check_ready(&self) -> Result<(), RepositoryError> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(RepositoryError::NotInitialized);
        }
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(RepositoryError::Shutdown);
        }
        Ok(())
    }
}
