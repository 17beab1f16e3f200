//! Error taxonomy for the coordinator core (see spec §7).

use thiserror::Error;

/// Errors surfaced by the `Store` capability.
///
/// `Transient` is retried by worker pools with backoff; `QueryCancelled` is
/// treated as a benign shutdown signal; `NoRows` is treated as success by
/// idempotent deletes.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transient store error: {0}")]
    Transient(String),
    #[error("query cancelled")]
    QueryCancelled,
    #[error("no rows")]
    NoRows,
}

impl StoreError {
    pub fn is_query_cancelled(&self) -> bool {
        matches!(self, StoreError::QueryCancelled)
    }

    pub fn is_no_rows(&self) -> bool {
        matches!(self, StoreError::NoRows)
    }
}

/// Errors surfaced by the `Pubsub` capability.
#[derive(Debug, Error)]
pub enum PubsubError {
    /// Sentinel: the bus may have dropped messages since the last delivery.
    #[error("pubsub may have dropped messages")]
    DroppedMessages,
    #[error("pubsub error: {0}")]
    Other(String),
}

/// Top-level coordinator error taxonomy.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("not authorized")]
    Unauthorized,
    #[error("coordinator unhealthy")]
    Unhealthy,
    #[error("failed to marshal node")]
    MarshalFailed,
    #[error("bad work queue key: {0}")]
    BadWorkKey(String),
    #[error("send on closed channel")]
    Closed,
}

/// Message sent to clients when the replica has declared itself unhealthy.
pub const CLOSE_ERR_UNHEALTHY: &str = "coordinator unhealthy";
