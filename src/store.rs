use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::types::{DispatchItem, ItemId, SubscriptionSet, SubscriptionSetId};

/// Durable storage contract consumed by the repository and its queues.
///
/// Implementations must make concurrent writes from different queues safe;
/// callers guarantee that writes for one subscription set's records never
/// interleave. Item ordering within `load_all` is unspecified; the
/// repository orders recovered items by sequence number.
#[async_trait]
pub trait Store: Send + Sync {
    /// Load every persisted subscription set together with its pending items.
    async fn load_all(&self) -> Result<Vec<(SubscriptionSet, Vec<DispatchItem>)>, StoreError>;

    /// Create or replace a subscription set record.
    async fn upsert_set(&self, set: &SubscriptionSet) -> Result<(), StoreError>;

    /// Remove a subscription set record and all of its pending items.
    async fn delete_set(&self, set_id: &SubscriptionSetId) -> Result<(), StoreError>;

    /// Create or replace one pending item under a subscription set.
    async fn upsert_item(
        &self,
        set_id: &SubscriptionSetId,
        item: &DispatchItem,
    ) -> Result<(), StoreError>;

    /// Remove one pending item.
    async fn delete_item(&self, set_id: &SubscriptionSetId, item_id: &ItemId)
        -> Result<(), StoreError>;
}

/// In-memory store for tests and lightweight deployments.
///
/// Shared behind an `Arc`, it doubles as a crash-survival stand-in: a new
/// repository initialized over the same instance recovers whatever a
/// previous one persisted.
#[derive(Default)]
pub struct InMemoryStore {
    sets: Mutex<HashMap<SubscriptionSetId, SubscriptionSet>>,
    items: Mutex<HashMap<SubscriptionSetId, HashMap<ItemId, DispatchItem>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn load_all(&self) -> Result<Vec<(SubscriptionSet, Vec<DispatchItem>)>, StoreError> {
        let sets = self.sets.lock().await;
        let items = self.items.lock().await;
        Ok(sets
            .values()
            .map(|set| {
                let pending = items
                    .get(&set.id)
                    .map(|by_id| by_id.values().cloned().collect())
                    .unwrap_or_default();
                (set.clone(), pending)
            })
            .collect())
    }

    async fn upsert_set(&self, set: &SubscriptionSet) -> Result<(), StoreError> {
        self.sets.lock().await.insert(set.id.clone(), set.clone());
        Ok(())
    }

    async fn delete_set(&self, set_id: &SubscriptionSetId) -> Result<(), StoreError> {
        self.sets.lock().await.remove(set_id);
        self.items.lock().await.remove(set_id);
        Ok(())
    }

    async fn upsert_item(
        &self,
        set_id: &SubscriptionSetId,
        item: &DispatchItem,
    ) -> Result<(), StoreError> {
        self.items
            .lock()
            .await
            .entry(set_id.clone())
            .or_default()
            .insert(item.id.clone(), item.clone());
        Ok(())
    }

    async fn delete_item(
        &self,
        set_id: &SubscriptionSetId,
        item_id: &ItemId,
    ) -> Result<(), StoreError> {
        if let Some(by_id) = self.items.lock().await.get_mut(set_id) {
            by_id.remove(item_id);
        }
        Ok(())
    }
}
