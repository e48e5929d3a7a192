//! Event Store Errors
//!
//! Error types for event store operations.

use uuid::Uuid;

use crate::codec::CodecError;

/// Errors that can occur in the event store
#[derive(Debug, thiserror::Error)]
pub enum EventStoreError {
    /// Optimistic concurrency conflict
    #[error("Concurrency conflict for aggregate {aggregate_id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        aggregate_id: Uuid,
        expected: i64,
        actual: i64,
    },

    /// Caller broke the append contract (empty batch, version gap, ...)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Transport kept failing after bounded retries
    #[error("Store unavailable after {attempts} attempts: {source}")]
    Unavailable {
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },

    /// Operation exceeded its deadline; the outcome is unknown
    #[error("Operation '{operation}' timed out")]
    Timeout { operation: &'static str },

    /// Stored payload failed the structural check
    #[error(transparent)]
    Corrupted(#[from] CodecError),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EventStoreError {
    /// Check if this error is a concurrency conflict
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, EventStoreError::ConcurrencyConflict { .. })
    }

    /// Check if this error is worth retrying from the outside
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EventStoreError::ConcurrencyConflict { .. } | EventStoreError::Unavailable { .. }
        )
    }
}
