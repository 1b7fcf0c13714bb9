#[cfg(feature = "postgres")]
use async_trait::async_trait;
#[cfg(feature = "postgres")]
use tokio_postgres::Client;

#[cfg(feature = "postgres")]
use crate::error::StoreError;
#[cfg(feature = "postgres")]
use crate::store::Store;
#[cfg(feature = "postgres")]
use crate::types::{DispatchItem, ItemId, SubscriptionSet, SubscriptionSetId};

/// Postgres-backed store.
///
/// Two JSONB tables, bootstrapped on construction: `pubsub_sets` keyed by
/// set identity, `pubsub_items` keyed by (set, item). `delete_set` cascades
/// over the items table.
#[cfg(feature = "postgres")]
pub struct PostgresStore {
    client: Client,
}

#[cfg(feature = "postgres")]
impl PostgresStore {
    pub async fn new(client: Client) -> Result<Self, StoreError> {
        client
            .execute(
                "CREATE TABLE IF NOT EXISTS pubsub_sets (
                    id TEXT PRIMARY KEY,
                    payload JSONB NOT NULL
                )",
                &[],
            )
            .await
            .map_err(io_err)?;

        client
            .execute(
                "CREATE TABLE IF NOT EXISTS pubsub_items (
                    set_id TEXT NOT NULL,
                    item_id TEXT NOT NULL,
                    seq BIGINT NOT NULL,
                    payload JSONB NOT NULL,
                    PRIMARY KEY (set_id, item_id)
                )",
                &[],
            )
            .await
            .map_err(io_err)?;

        Ok(Self { client })
    }
}

#[cfg(feature = "postgres")]
fn io_err(err: tokio_postgres::Error) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

#[cfg(feature = "postgres")]
fn corrupt(err: serde_json::Error) -> StoreError {
    StoreError::Corrupt(err.to_string())
}

#[cfg(feature = "postgres")]
#[async_trait]
impl Store for PostgresStore {
    async fn load_all(&self) -> Result<Vec<(SubscriptionSet, Vec<DispatchItem>)>, StoreError> {
        let set_rows = self
            .client
            .query("SELECT payload FROM pubsub_sets", &[])
            .await
            .map_err(io_err)?;

        let mut recovered = Vec::with_capacity(set_rows.len());
        for row in set_rows {
            let payload: serde_json::Value = row.try_get(0).map_err(io_err)?;
            let set: SubscriptionSet = serde_json::from_value(payload).map_err(corrupt)?;

            let item_rows = self
                .client
                .query(
                    "SELECT payload FROM pubsub_items WHERE set_id = $1 ORDER BY seq",
                    &[&set.id.0],
                )
                .await
                .map_err(io_err)?;

            let mut pending = Vec::with_capacity(item_rows.len());
            for row in item_rows {
                let payload: serde_json::Value = row.try_get(0).map_err(io_err)?;
                pending.push(serde_json::from_value::<DispatchItem>(payload).map_err(corrupt)?);
            }
            recovered.push((set, pending));
        }
        Ok(recovered)
    }

    async fn upsert_set(&self, set: &SubscriptionSet) -> Result<(), StoreError> {
        let payload = serde_json::to_value(set).map_err(corrupt)?;
        self.client
            .execute(
                "INSERT INTO pubsub_sets (id, payload)
                 VALUES ($1, $2)
                 ON CONFLICT (id) DO UPDATE SET payload = EXCLUDED.payload",
                &[&set.id.0, &payload],
            )
            .await
            .map_err(io_err)?;
        Ok(())
    }

    async fn delete_set(&self, set_id: &SubscriptionSetId) -> Result<(), StoreError> {
        self.client
            .execute("DELETE FROM pubsub_items WHERE set_id = $1", &[&set_id.0])
            .await
            .map_err(io_err)?;
        self.client
            .execute("DELETE FROM pubsub_sets WHERE id = $1", &[&set_id.0])
            .await
            .map_err(io_err)?;
        Ok(())
    }

    async fn upsert_item(
        &self,
        set_id: &SubscriptionSetId,
        item: &DispatchItem,
    ) -> Result<(), StoreError> {
        let payload = serde_json::to_value(item).map_err(corrupt)?;
        let seq = item.seq as i64;
        self.client
            .execute(
                "INSERT INTO pubsub_items (set_id, item_id, seq, payload)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (set_id, item_id) DO UPDATE
                 SET seq = EXCLUDED.seq, payload = EXCLUDED.payload",
                &[&set_id.0, &item.id.0, &seq, &payload],
            )
            .await
            .map_err(io_err)?;
        Ok(())
    }

    async fn delete_item(
        &self,
        set_id: &SubscriptionSetId,
        item_id: &ItemId,
    ) -> Result<(), StoreError> {
        self.client
            .execute(
                "DELETE FROM pubsub_items WHERE set_id = $1 AND item_id = $2",
                &[&set_id.0, &item_id.0],
            )
            .await
            .map_err(io_err)?;
        Ok(())
    }
}
