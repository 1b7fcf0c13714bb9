//! A persistent publish/subscribe dispatch-queue subsystem.
//!
//! This crate maintains one **durable, ordered** queue of pending
//! notification items per active subscription and drives delivery through a
//! pluggable handler with retry-on-failure semantics.
//!
//! ## Guarantees
//! - Durability across restarts: an enqueued item is persisted before the
//!   call returns and survives a crash until its outcome is recorded
//! - Per-subscriber ordering: items are attempted in enqueue order, and a
//!   failing head item is retried before anything behind it
//! - At-least-once delivery, bounded by a configurable retry budget
//! - Per-subscriber isolation: a slow or failing subscriber never delays
//!   another subscriber's deliveries
//!
//! ## Non-Guarantees
//! - Exactly-once delivery (handlers must tolerate duplicates)
//! - Cross-subscriber ordering
//! - Distributed coordination
//! - A delivery transport, event matching, or a storage engine: transports
//!   live behind [`DeliveryHandler`], storage behind [`Store`]
//!
//! This crate is intentionally **not a hosted service**. It exists to hold
//! the hard part of pub/sub delivery inside a single process: reconciling
//! in-memory queue state with durable storage and recovering cleanly after
//! a crash.

mod error;
mod queue;
mod repository;
mod store;
mod types;

#[cfg(feature = "redis")]
mod store_redis;

#[cfg(feature = "postgres")]
mod store_postgres;

pub use error::{EnqueueError, FailureReason, RepositoryError, StoreError};
pub use queue::{DeliveryHandler, DispatchQueue, HandlerError};
pub use repository::{DispatchQueueRepository, RepositoryConfig};
pub use store::{InMemoryStore, Store};
pub use types::{DeadLetterEntry, DispatchItem, ItemId, SubscriptionSet, SubscriptionSetId};

#[cfg(feature = "redis")]
pub use store_redis::RedisStore;

#[cfg(feature = "postgres")]
pub use store_postgres::PostgresStore;
