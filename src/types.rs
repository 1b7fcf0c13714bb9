use serde::{Deserialize, Serialize};

use crate::error::FailureReason;

/// A subscriber's registered interest and delivery destination.
///
/// A `SubscriptionSet` describes *who* a queue belongs to and *where* its
/// items should be delivered. It is a pure configuration object with no
/// internal state; the repository keys queues by its identity, not by its
/// version or destination.
///
/// Sets must be registered with the repository before items can be enqueued
/// for them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionSet {
    /// Stable identity of the subscriber.
    pub id: SubscriptionSetId,

    /// Opaque delivery destination metadata, interpreted by the handler.
    pub destination: String,

    /// Revision marker. `register_or_update` with an unchanged version is a
    /// no-op; a different version replaces the stored record in place.
    pub version: u64,
}

impl SubscriptionSet {
    /// Create a new subscription set at version 0.
    pub fn new(id: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            id: SubscriptionSetId(id.into()),
            destination: destination.into(),
            version: 0,
        }
    }

    /// Set the revision marker.
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Replace the delivery destination.
    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = destination.into();
        self
    }
}

/// Unique identifier for a subscription set.
///
/// This is a strongly-typed wrapper to avoid accidental mixing
/// of subscription identities with other string identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionSetId(pub String);

/// Unique identifier for a dispatch item.
///
/// This is a strongly-typed wrapper to avoid accidental mixing
/// of item IDs with other string identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemId(pub String);

/// One unit of notification work queued for a subscriber.
///
/// The queue treats the payload as opaque bytes. Serialization and schema
/// management are the caller's responsibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchItem {
    /// Logical identifier for the item.
    pub id: ItemId,

    /// Serialized notification payload.
    pub payload: Vec<u8>,

    /// Enqueue sequence number, monotonic per queue. Assigned by the owning
    /// queue at enqueue time; establishes delivery order.
    pub seq: u64,

    /// Number of delivery attempts made so far.
    pub attempt: u32,

    /// Earliest wall-clock time (unix milliseconds) for the next attempt.
    /// Zero means immediately eligible.
    pub not_before_ms: u64,
}

impl DispatchItem {
    /// Create a new item with the given ID and payload.
    ///
    /// Sequence number and retry state are owned by the queue and assigned
    /// on enqueue.
    pub fn new(id: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: ItemId(id.into()),
            payload: payload.into(),
            seq: 0,
            attempt: 0,
            not_before_ms: 0,
        }
    }
}

/// Terminal record for an item that exceeded its retry budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub set_id: SubscriptionSetId,
    pub item: DispatchItem,
    pub reason: FailureReason,
    pub created_at_secs: u64,
}
