#[cfg(feature = "redis")]
use async_trait::async_trait;
#[cfg(feature = "redis")]
use redis::AsyncCommands;

#[cfg(feature = "redis")]
use crate::error::StoreError;
#[cfg(feature = "redis")]
use crate::store::Store;
#[cfg(feature = "redis")]
use crate::types::{DispatchItem, ItemId, SubscriptionSet, SubscriptionSetId};

/// Redis-backed store.
///
/// Subscription sets live in one hash keyed by identity; each set's pending
/// items live in their own hash so `delete_set` can drop them in one `DEL`.
/// Values are JSON documents.
#[cfg(feature = "redis")]
pub struct RedisStore {
    client: redis::Client,
    prefix: String,
}

#[cfg(feature = "redis")]
impl RedisStore {
    pub fn new(client: redis::Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    fn sets_key(&self) -> String {
        format!("{}:sets", self.prefix)
    }

    fn items_key(&self, set_id: &SubscriptionSetId) -> String {
        format!("{}:items:{}", self.prefix, set_id.0)
    }

    async fn connection(&self) -> Result<redis::aio::Connection, StoreError> {
        self.client
            .get_tokio_connection()
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))
    }
}

#[cfg(feature = "redis")]
fn encode<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|err| StoreError::Corrupt(err.to_string()))
}

#[cfg(feature = "redis")]
fn decode<T: serde::de::DeserializeOwned>(value: &str) -> Result<T, StoreError> {
    serde_json::from_str(value).map_err(|err| StoreError::Corrupt(err.to_string()))
}

#[cfg(feature = "redis")]
fn io_err(err: redis::RedisError) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

#[cfg(feature = "redis")]
#[async_trait]
impl Store for RedisStore {
    async fn load_all(&self) -> Result<Vec<(SubscriptionSet, Vec<DispatchItem>)>, StoreError> {
        let mut conn = self.connection().await?;
        let sets: std::collections::HashMap<String, String> =
            conn.hgetall(self.sets_key()).await.map_err(io_err)?;

        let mut recovered = Vec::with_capacity(sets.len());
        for value in sets.values() {
            let set: SubscriptionSet = decode(value)?;
            let items: std::collections::HashMap<String, String> = conn
                .hgetall(self.items_key(&set.id))
                .await
                .map_err(io_err)?;
            let mut pending = Vec::with_capacity(items.len());
            for value in items.values() {
                pending.push(decode::<DispatchItem>(value)?);
            }
            recovered.push((set, pending));
        }
        Ok(recovered)
    }

    async fn upsert_set(&self, set: &SubscriptionSet) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let payload = encode(set)?;
        conn.hset::<_, _, _, ()>(self.sets_key(), set.id.0.clone(), payload)
            .await
            .map_err(io_err)
    }

    async fn delete_set(&self, set_id: &SubscriptionSetId) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        conn.hdel::<_, _, ()>(self.sets_key(), set_id.0.clone())
            .await
            .map_err(io_err)?;
        conn.del::<_, ()>(self.items_key(set_id)).await.map_err(io_err)
    }

    async fn upsert_item(
        &self,
        set_id: &SubscriptionSetId,
        item: &DispatchItem,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let payload = encode(item)?;
        conn.hset::<_, _, _, ()>(self.items_key(set_id), item.id.0.clone(), payload)
            .await
            .map_err(io_err)
    }

    async fn delete_item(
        &self,
        set_id: &SubscriptionSetId,
        item_id: &ItemId,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        conn.hdel::<_, _, ()>(self.items_key(set_id), item_id.0.clone())
            .await
            .map_err(io_err)
    }
}
