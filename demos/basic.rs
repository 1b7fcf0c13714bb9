use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pubsub_dispatch::{
    DeliveryHandler, DispatchItem, DispatchQueueRepository, HandlerError, InMemoryStore,
    RepositoryConfig, SubscriptionSet,
};

struct PrintHandler;

#[async_trait]
impl DeliveryHandler for PrintHandler {
    async fn deliver(
        &self,
        set: &SubscriptionSet,
        item: &DispatchItem,
    ) -> Result<bool, HandlerError> {
        println!(
            "deliver {} -> {} ({} bytes)",
            item.id.0,
            set.destination,
            item.payload.len()
        );
        Ok(true)
    }
}

#[tokio::main]
async fn main() {
    let store = Arc::new(InMemoryStore::new());
    let repository = DispatchQueueRepository::new(store, RepositoryConfig::default());

    let recovered = repository
        .initialize(Arc::new(PrintHandler))
        .await
        .expect("initialize");
    println!("recovered {} subscription sets", recovered.len());

    let orders = SubscriptionSet::new("orders", "https://example.com/notify");
    repository
        .register_or_update(orders.clone())
        .await
        .expect("register");

    let queue = repository.get(&orders).await.expect("registered above");
    queue
        .enqueue(DispatchItem::new("item_1", r#"{"id":123}"#.as_bytes()))
        .await
        .expect("enqueue");
    queue
        .enqueue(DispatchItem::new("item_2", r#"{"id":124}"#.as_bytes()))
        .await
        .expect("enqueue");

    // Let the delivery loop drain the backlog.
    tokio::time::sleep(Duration::from_millis(200)).await;

    repository.shutdown().await;
}
