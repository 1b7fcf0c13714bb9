use std::fmt;

use serde::{Deserialize, Serialize};

/// Errors surfaced by the persistence store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached or refused the operation.
    Unavailable(String),

    /// A stored record could not be encoded or decoded.
    Corrupt(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Unavailable(detail) =>
                write!(f, "store unavailable: {}", detail),
            StoreError::Corrupt(detail) =>
                write!(f, "store record corrupt: {}", detail),
        }
    }
}

impl std::error::Error for StoreError {}

/// Errors returned by repository lifecycle operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    /// `initialize` was called more than once.
    AlreadyInitialized,

    /// An operation other than `initialize` was called first.
    NotInitialized,

    /// The repository has been shut down.
    Shutdown,

    /// The persistence store failed and the failure could not be resolved
    /// within the retry policy.
    Store(StoreError),
}

impl fmt::Display for RepositoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepositoryError::AlreadyInitialized =>
                write!(f, "repository is already initialized"),
            RepositoryError::NotInitialized =>
                write!(f, "repository is not initialized"),
            RepositoryError::Shutdown =>
                write!(f, "repository is shut down"),
            RepositoryError::Store(err) =>
                write!(f, "{}", err),
        }
    }
}

impl std::error::Error for RepositoryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RepositoryError::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for RepositoryError {
    fn from(err: StoreError) -> Self {
        RepositoryError::Store(err)
    }
}

/// Errors returned when enqueueing an item fails *before* it is accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueError {
    /// The queue has been stopped or removed.
    Shutdown,

    /// The item could not be durably persisted; it was not queued.
    Store(StoreError),
}

impl fmt::Display for EnqueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnqueueError::Shutdown =>
                write!(f, "queue is shut down"),
            EnqueueError::Store(err) =>
                write!(f, "{}", err),
        }
    }
}

impl std::error::Error for EnqueueError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EnqueueError::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for EnqueueError {
    fn from(err: StoreError) -> Self {
        EnqueueError::Store(err)
    }
}

/// Why a delivery attempt (or an item's whole retry budget) failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// The handler declined the item.
    Rejected,

    /// The handler returned an error.
    HandlerError,

    /// The attempt exceeded the configured per-attempt timeout.
    Timeout,

    /// The retry budget was exhausted.
    MaxRetriesExceeded,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Rejected =>
                write!(f, "handler declined delivery"),
            FailureReason::HandlerError =>
                write!(f, "handler returned an error"),
            FailureReason::Timeout =>
                write!(f, "delivery attempt timed out"),
            FailureReason::MaxRetriesExceeded =>
                write!(f, "maximum retries exceeded"),
        }
    }
}
