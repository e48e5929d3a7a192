//! event_engine Library
//!
//! Event-sourced aggregate persistence engine for PostgreSQL: an append-only
//! event log with per-aggregate optimistic concurrency, snapshot-accelerated
//! replay, a transactional outbox and checkpointed projections.
//!
//! The command path is [`Repository`]: load an aggregate, run a command, save
//! the batch atomically. The read path is [`ProjectionEngine`], which tails
//! the log in global-sequence order. [`OutboxPublisher`] ships committed
//! events to downstream sinks at-least-once.

pub mod aggregate;
pub mod codec;
pub mod config;
pub mod context;
pub mod db;
pub mod event_store;
pub mod outbox;
pub mod projection;
pub mod repository;
pub mod snapshot;
pub mod telemetry;

mod error;

pub use aggregate::{Aggregate, AggregateError, AggregateRoot};
pub use codec::{CodecError, DomainEvent, JsonEventCodec, Upcaster, UpcasterChain};
pub use config::{ConfigError, EngineConfig, TenancyConfig};
pub use context::OperationContext;
pub use error::{EngineError, EngineResult};
pub use event_store::{EventEnvelope, EventStore, EventStoreConfig, EventStoreError, NewEvent};
pub use outbox::{
    EventSink, OutboxConfig, OutboxEntry, OutboxError, OutboxPublisher, OutboxPublisherHandle,
    OutboxStatus, OutboxStatusReport,
};
pub use projection::{
    Projection, ProjectionConfig, ProjectionEngine, ProjectionError, ProjectionHealth,
    ProjectionStatus,
};
pub use repository::{Repository, RepositoryConfig, RepositoryError};
pub use snapshot::{Snapshot, SnapshotCacheConfig, SnapshotError, SnapshotStore};
