//! Aggregate module
//!
//! Aggregate Root pattern implementation for Event Sourcing.
//!
//! [`Aggregate`] is the state + dispatch half implemented by domain types;
//! [`AggregateRoot`] is the runtime that owns identity, version and the
//! uncommitted-event buffer, and routes events through the dispatch.

use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

use crate::codec::DomainEvent;
use crate::snapshot::Snapshot;

/// Aggregate trait that all aggregates must implement.
///
/// State is derived from events, never directly mutated. Dispatch is a
/// compile-time exhaustive match on the event enum; handlers must not apply
/// further events from within `handle`.
pub trait Aggregate: Default + Send + Sync {
    /// The type of events this aggregate handles
    type Event: DomainEvent;

    /// Get the aggregate type name (for storage)
    fn aggregate_type() -> &'static str;

    /// Mutate state for one event
    fn handle(&mut self, event: &Self::Event) -> Result<(), AggregateError>;
}

/// Errors raised by the aggregate runtime
#[derive(Debug, thiserror::Error)]
pub enum AggregateError {
    /// No handler matched the event and it is not marked tolerant
    #[error("No handler registered for event '{event_type}'")]
    UnhandledEvent { event_type: String },

    /// Caller contract broken (wrong aggregate, dirty replay, ...)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Replayed stream does not form the contiguous sequence 1..N
    #[error("Version gap during replay: expected {expected}, found {found}")]
    VersionGap { expected: i64, found: i64 },

    /// Replayed envelope belongs to a different aggregate type
    #[error("Aggregate type mismatch: expected '{expected}', found '{found}'")]
    TypeMismatch { expected: String, found: String },
}

/// In-memory aggregate instance: state, version and uncommitted events
pub struct AggregateRoot<A: Aggregate> {
    id: Uuid,
    version: i64,
    state: A,
    uncommitted: Vec<A::Event>,
}

impl<A: Aggregate> std::fmt::Debug for AggregateRoot<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateRoot")
            .field("aggregate_type", &A::aggregate_type())
            .field("id", &self.id)
            .field("version", &self.version)
            .field("uncommitted", &self.uncommitted.len())
            .finish()
    }
}

impl<A: Aggregate> AggregateRoot<A> {
    /// An empty aggregate at version 0 with no pending events
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            version: 0,
            state: A::default(),
            uncommitted: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current version (number of events applied)
    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn state(&self) -> &A {
        &self.state
    }

    /// True until the first event is applied or replayed
    pub fn is_new(&self) -> bool {
        self.version == 0
    }

    pub fn uncommitted_len(&self) -> usize {
        self.uncommitted.len()
    }

    /// Apply a new event produced by a business method.
    ///
    /// Dispatches the event, buffers it for the next save and bumps the
    /// in-memory version. Tolerant events that no handler matches skip the
    /// state change but still advance the version.
    pub fn apply(&mut self, event: A::Event) -> Result<(), AggregateError> {
        if event.aggregate_id() != self.id {
            return Err(AggregateError::InvalidArgument(format!(
                "event for aggregate {} applied to aggregate {}",
                event.aggregate_id(),
                self.id
            )));
        }

        self.dispatch(&event)?;
        self.version += 1;
        self.uncommitted.push(event);
        Ok(())
    }

    /// Replay one persisted event at its stored position.
    ///
    /// Uses the same dispatch as [`apply`](Self::apply) but does not buffer.
    /// Requires an empty uncommitted buffer and contiguous versions.
    pub fn replay_one(
        &mut self,
        aggregate_type: &str,
        aggregate_version: i64,
        event: A::Event,
    ) -> Result<(), AggregateError> {
        if !self.uncommitted.is_empty() {
            return Err(AggregateError::InvalidArgument(
                "replay invoked on an aggregate with uncommitted events".to_string(),
            ));
        }
        if aggregate_type != A::aggregate_type() {
            return Err(AggregateError::TypeMismatch {
                expected: A::aggregate_type().to_string(),
                found: aggregate_type.to_string(),
            });
        }
        if event.aggregate_id() != self.id {
            return Err(AggregateError::InvalidArgument(format!(
                "replayed event for aggregate {} on aggregate {}",
                event.aggregate_id(),
                self.id
            )));
        }
        if aggregate_version != self.version + 1 {
            return Err(AggregateError::VersionGap {
                expected: self.version + 1,
                found: aggregate_version,
            });
        }

        self.dispatch(&event)?;
        self.version = aggregate_version;
        Ok(())
    }

    /// Replay an ordered sequence of `(version, event)` pairs
    pub fn replay<I>(&mut self, events: I) -> Result<(), AggregateError>
    where
        I: IntoIterator<Item = (i64, A::Event)>,
    {
        for (aggregate_version, event) in events {
            self.replay_one(A::aggregate_type(), aggregate_version, event)?;
        }
        Ok(())
    }

    /// Take the uncommitted events, leaving the buffer empty
    pub fn drain(&mut self) -> Vec<A::Event> {
        std::mem::take(&mut self.uncommitted)
    }

    /// Rehydrate state and version from a snapshot
    pub fn restore_from(&mut self, snapshot: &Snapshot) -> Result<(), AggregateError>
    where
        A: DeserializeOwned,
    {
        if snapshot.aggregate_id != self.id {
            return Err(AggregateError::InvalidArgument(format!(
                "snapshot for aggregate {} restored into aggregate {}",
                snapshot.aggregate_id, self.id
            )));
        }
        if snapshot.aggregate_type != A::aggregate_type() {
            return Err(AggregateError::TypeMismatch {
                expected: A::aggregate_type().to_string(),
                found: snapshot.aggregate_type.clone(),
            });
        }

        self.state = serde_json::from_value(snapshot.state.clone()).map_err(|e| {
            AggregateError::InvalidArgument(format!("snapshot state does not deserialize: {e}"))
        })?;
        self.version = snapshot.aggregate_version;
        self.uncommitted.clear();
        Ok(())
    }

    /// Serialize the current state as a snapshot at the current version
    pub fn snapshot(&self) -> Result<Snapshot, serde_json::Error>
    where
        A: Serialize,
    {
        Ok(Snapshot {
            aggregate_id: self.id,
            aggregate_type: A::aggregate_type().to_string(),
            aggregate_version: self.version,
            state: serde_json::to_value(&self.state)?,
            created_at: chrono::Utc::now(),
        })
    }

    fn dispatch(&mut self, event: &A::Event) -> Result<(), AggregateError> {
        match self.state.handle(event) {
            Ok(()) => Ok(()),
            Err(AggregateError::UnhandledEvent { .. }) if event.tolerant() => Ok(()),
            Err(e) => Err(e),
        }
    }
}
