//! Error handling module
//!
//! Crate-level error type folding the per-module errors for embedders that
//! want a single surface.

/// Engine-wide Result type
pub type EngineResult<T> = Result<T, EngineError>;

/// Engine error types
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Store(#[from] crate::event_store::EventStoreError),

    #[error(transparent)]
    Snapshot(#[from] crate::snapshot::SnapshotError),

    #[error(transparent)]
    Aggregate(#[from] crate::aggregate::AggregateError),

    #[error(transparent)]
    Codec(#[from] crate::codec::CodecError),

    #[error(transparent)]
    Repository(#[from] crate::repository::RepositoryError),

    #[error(transparent)]
    Outbox(#[from] crate::outbox::OutboxError),

    #[error(transparent)]
    Projection(#[from] crate::projection::ProjectionError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl EngineError {
    /// Check if this error is an optimistic concurrency conflict
    pub fn is_concurrency_conflict(&self) -> bool {
        match self {
            EngineError::Store(e) => e.is_concurrency_conflict(),
            EngineError::Repository(e) => e.is_concurrency_conflict(),
            _ => false,
        }
    }
}
