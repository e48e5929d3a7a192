//! Repository
//!
//! The command boundary: loads-or-reconstructs an aggregate, runs a
//! caller-supplied command against it, persists the resulting batch
//! atomically and snapshots when the threshold is crossed. Concurrency
//! conflicts are recovered by reload-and-re-execute when enabled.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

use crate::aggregate::{Aggregate, AggregateError, AggregateRoot};
use crate::codec::{CodecError, JsonEventCodec, UpcasterChain};
use crate::config::EngineConfig;
use crate::context::OperationContext;
use crate::event_store::{EventEnvelope, EventStore, EventStoreError, NewEvent};
use crate::snapshot::{SnapshotError, SnapshotStore};

/// Repository tuning knobs
#[derive(Debug, Clone)]
pub struct RepositoryConfig {
    /// Events between snapshots; `0` disables snapshotting
    pub snapshot_threshold: i64,
    /// Whether `execute` reloads and retries on a concurrency conflict
    pub retry_on_conflict: bool,
    /// Maximum conflict retries
    pub retry_max: u32,
    /// Base delay for exponential backoff between conflict retries
    pub retry_base_delay: Duration,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            snapshot_threshold: 50,
            retry_on_conflict: true,
            retry_max: 3,
            retry_base_delay: Duration::from_millis(100),
        }
    }
}

impl RepositoryConfig {
    /// Derive the repository knobs from the engine configuration
    pub fn from_engine(config: &EngineConfig) -> Self {
        Self {
            snapshot_threshold: config.snapshot_threshold,
            retry_on_conflict: config.retry_max > 0,
            retry_max: config.retry_max,
            retry_base_delay: config.retry_base_delay,
        }
    }
}

/// Repository errors
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error(transparent)]
    Store(#[from] EventStoreError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The caller-supplied command failed; never retried
    #[error("Command failed: {0}")]
    Command(#[source] anyhow::Error),
}

impl RepositoryError {
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, RepositoryError::Store(e) if e.is_concurrency_conflict())
    }
}

/// Repository for one aggregate type
pub struct Repository<A: Aggregate> {
    store: EventStore,
    snapshots: SnapshotStore,
    upcasters: Arc<UpcasterChain>,
    config: RepositoryConfig,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A> Repository<A>
where
    A: Aggregate + Serialize + DeserializeOwned,
{
    pub fn new(
        store: EventStore,
        snapshots: SnapshotStore,
        upcasters: Arc<UpcasterChain>,
        config: RepositoryConfig,
    ) -> Self {
        Self {
            store,
            snapshots,
            upcasters,
            config,
            _aggregate: PhantomData,
        }
    }

    /// Load or reconstruct an aggregate.
    ///
    /// Tries the snapshot (cache first), then replays the remaining events
    /// through the upcaster chain. An aggregate with no history loads as an
    /// empty root at version 0.
    pub async fn load(
        &self,
        ctx: &OperationContext,
        id: Uuid,
    ) -> Result<AggregateRoot<A>, RepositoryError> {
        let mut root = AggregateRoot::<A>::new(id);

        if let Some(snapshot) = self.snapshots.load(A::aggregate_type(), id).await? {
            root.restore_from(&snapshot)?;
        }

        let mut stream =
            self.store
                .load_stream(ctx, id, A::aggregate_type(), root.version() + 1)?;

        while let Some(envelope) = stream.try_next().await? {
            let event: A::Event = JsonEventCodec::decode(&envelope.payload, &self.upcasters)?;
            root.replay_one(&envelope.aggregate_type, envelope.aggregate_version, event)?;
        }

        Ok(root)
    }

    /// Persist the aggregate's uncommitted events atomically.
    ///
    /// On success the returned envelopes carry the assigned global sequences.
    /// A concurrency conflict leaves the store untouched; the caller must
    /// reload before trying again (or use [`execute`](Self::execute)).
    pub async fn save(
        &self,
        ctx: &OperationContext,
        root: &mut AggregateRoot<A>,
    ) -> Result<Vec<EventEnvelope>, RepositoryError> {
        if root.uncommitted_len() == 0 {
            return Ok(Vec::new());
        }

        let expected_version = root.version() - root.uncommitted_len() as i64;
        let events = root.drain();

        let mut batch = Vec::with_capacity(events.len());
        for (i, event) in events.iter().enumerate() {
            batch.push(NewEvent::from_domain(expected_version + i as i64 + 1, event)?);
        }

        let envelopes = self
            .store
            .append(ctx, root.id(), A::aggregate_type(), expected_version, batch)
            .await?;

        // Snapshotting happens outside the append transaction and is
        // best-effort only.
        self.maybe_snapshot(root).await;

        Ok(envelopes)
    }

    /// Load, run a command and save, retrying conflicts when configured.
    ///
    /// The command must be deterministic enough to re-execute against a
    /// freshly loaded aggregate. Command errors surface immediately and are
    /// never retried.
    pub async fn execute<F>(
        &self,
        ctx: &OperationContext,
        id: Uuid,
        command: F,
    ) -> Result<AggregateRoot<A>, RepositoryError>
    where
        F: Fn(&mut AggregateRoot<A>) -> anyhow::Result<()>,
    {
        let mut attempt: u32 = 0;

        loop {
            let mut root = self.load(ctx, id).await?;
            command(&mut root).map_err(RepositoryError::Command)?;

            match self.save(ctx, &mut root).await {
                Ok(_) => return Ok(root),
                Err(e)
                    if e.is_concurrency_conflict()
                        && self.config.retry_on_conflict
                        && attempt < self.config.retry_max =>
                {
                    let delay = self.config.retry_base_delay * 2u32.saturating_pow(attempt);
                    attempt += 1;
                    tracing::warn!(
                        aggregate_id = %id,
                        aggregate_type = A::aggregate_type(),
                        attempt,
                        "Concurrency conflict, reloading and retrying command"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Persist a snapshot when the threshold since the last one is crossed
    async fn maybe_snapshot(&self, root: &AggregateRoot<A>) {
        if self.config.snapshot_threshold <= 0 {
            return;
        }

        let last_version = match self.snapshots.load(A::aggregate_type(), root.id()).await {
            Ok(snapshot) => snapshot.map(|s| s.aggregate_version).unwrap_or(0),
            Err(e) => {
                tracing::warn!(
                    aggregate_id = %root.id(),
                    error = %e,
                    "Skipping snapshot: could not read last snapshot version"
                );
                return;
            }
        };

        if root.version() - last_version < self.config.snapshot_threshold {
            return;
        }

        let snapshot = match root.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(
                    aggregate_id = %root.id(),
                    error = %e,
                    "Skipping snapshot: state did not serialize"
                );
                return;
            }
        };

        if let Err(e) = self.snapshots.save(&snapshot).await {
            tracing::warn!(
                aggregate_id = %root.id(),
                version = root.version(),
                error = %e,
                "Snapshot save failed"
            );
        }
    }
}
