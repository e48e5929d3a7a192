//! Projection module
//!
//! Builds read models by tailing the event log in global-sequence order.
//! Each registered projection runs its own tick loop; read-model writes and
//! the checkpoint advance share one transaction, so a projection can be
//! killed and restarted without regressing or double-committing.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::{PgPool, Postgres, Transaction};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::codec::{CodecError, JsonEventCodec, UpcasterChain};
use crate::context::OperationContext;
use crate::event_store::{EventEnvelope, EventStore, EventStoreError};

/// A read model fed from the event log.
///
/// `apply` runs inside the engine's transaction; implementations write their
/// read-model rows through the provided transaction and must be idempotent
/// per event (the engine guarantees at-least-once application).
#[async_trait]
pub trait Projection: Send + Sync {
    /// Unique projection name, used as the checkpoint key
    fn name(&self) -> &str;

    /// Apply one envelope to the read model
    async fn apply(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        envelope: &EventEnvelope,
    ) -> Result<(), ProjectionError>;

    /// Wipe the read model; invoked by [`ProjectionEngine::reset`]
    async fn truncate(&self, tx: &mut Transaction<'_, Postgres>) -> Result<(), ProjectionError>;
}

/// Engine tuning knobs
#[derive(Debug, Clone)]
pub struct ProjectionConfig {
    /// Envelopes fetched per tick
    pub batch: i64,
    /// Sleep after a tick that came back short
    pub poll_interval: Duration,
    /// Context used for event-log reads (tenancy)
    pub context: OperationContext,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            batch: 100,
            poll_interval: Duration::from_millis(500),
            context: OperationContext::new(),
        }
    }
}

impl ProjectionConfig {
    /// Derive the engine-loop knobs from the engine configuration
    pub fn from_engine(config: &crate::config::EngineConfig) -> Self {
        Self {
            batch: config.projection_batch,
            poll_interval: config.projection_poll_interval,
            context: OperationContext::new(),
        }
    }
}

/// Health of a registered projection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectionHealth {
    Running,
    /// The loop stopped at a poisonous event and will not continue
    Halted(String),
}

/// Point-in-time view of one projection
#[derive(Debug, Clone)]
pub struct ProjectionStatus {
    pub name: String,
    pub checkpoint: i64,
    /// Committed events not yet applied
    pub lag: i64,
    pub health: ProjectionHealth,
}

/// Projection engine errors
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Store(#[from] EventStoreError),

    /// Payload at this sequence cannot be brought to the current schema
    #[error("Corrupted event at global sequence {sequence}: {source}")]
    Corrupted {
        sequence: i64,
        #[source]
        source: CodecError,
    },

    #[error("Projection '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("Projection '{0}' is not registered")]
    NotFound(String),

    /// Projection-specific handler failure
    #[error("Projection handler failed: {0}")]
    Handler(String),
}

impl ProjectionError {
    /// Transient errors are retried by the loop instead of halting it
    fn is_transient(&self) -> bool {
        match self {
            ProjectionError::Database(e) => {
                matches!(e, sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut)
            }
            ProjectionError::Store(e) => {
                matches!(e, EventStoreError::Unavailable { .. })
            }
            _ => false,
        }
    }
}

struct Slot {
    projection: Arc<dyn Projection>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    health: Arc<RwLock<ProjectionHealth>>,
}

/// Runs registered projections against the event log
pub struct ProjectionEngine {
    store: EventStore,
    pool: PgPool,
    upcasters: Arc<UpcasterChain>,
    config: ProjectionConfig,
    slots: Mutex<HashMap<String, Slot>>,
}

impl ProjectionEngine {
    pub fn new(store: EventStore, upcasters: Arc<UpcasterChain>, config: ProjectionConfig) -> Self {
        let pool = store.pool().clone();
        Self {
            store,
            pool,
            upcasters,
            config,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Register a projection and start its tick loop.
    ///
    /// Creates the checkpoint row on first registration.
    pub async fn register(&self, projection: Arc<dyn Projection>) -> Result<(), ProjectionError> {
        let name = projection.name().to_string();
        let mut slots = self.slots.lock().await;

        if slots.contains_key(&name) {
            return Err(ProjectionError::AlreadyRegistered(name));
        }

        sqlx::query(
            r#"
            INSERT INTO projection_checkpoints (projection_name, last_global_sequence)
            VALUES ($1, 0)
            ON CONFLICT (projection_name) DO NOTHING
            "#,
        )
        .bind(&name)
        .execute(&self.pool)
        .await?;

        let slot = self.spawn(projection);
        slots.insert(name, slot);
        Ok(())
    }

    /// Rebuild a projection from scratch: stop its loop, zero the checkpoint
    /// and truncate the read model in one transaction, then restart.
    pub async fn reset(&self, name: &str) -> Result<(), ProjectionError> {
        let mut slots = self.slots.lock().await;
        let slot = slots
            .remove(name)
            .ok_or_else(|| ProjectionError::NotFound(name.to_string()))?;

        let projection = slot.projection.clone();
        let _ = slot.shutdown.send(true);
        if let Err(e) = slot.task.await {
            tracing::error!(projection = name, error = %e, "Projection task join failed");
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            UPDATE projection_checkpoints
            SET last_global_sequence = 0, updated_at = NOW()
            WHERE projection_name = $1
            "#,
        )
        .bind(name)
        .execute(&mut *tx)
        .await?;
        projection.truncate(&mut tx).await?;
        tx.commit().await?;

        tracing::info!(projection = name, "Projection reset, rebuilding from sequence 0");

        let slot = self.spawn(projection);
        slots.insert(name.to_string(), slot);
        Ok(())
    }

    /// Checkpoint, lag and health of one projection
    pub async fn status(&self, name: &str) -> Result<ProjectionStatus, ProjectionError> {
        let slots = self.slots.lock().await;
        let slot = slots
            .get(name)
            .ok_or_else(|| ProjectionError::NotFound(name.to_string()))?;

        let health = slot
            .health
            .read()
            .map(|h| h.clone())
            .unwrap_or_else(|_| ProjectionHealth::Halted("health lock poisoned".to_string()));
        drop(slots);

        let checkpoint = read_checkpoint(&self.pool, name).await?;
        let highest = self.store.highest_global_sequence().await?;

        Ok(ProjectionStatus {
            name: name.to_string(),
            checkpoint,
            lag: (highest - checkpoint).max(0),
            health,
        })
    }

    /// Stop every projection loop
    pub async fn shutdown(&self) {
        let mut slots = self.slots.lock().await;
        for (name, slot) in slots.drain() {
            let _ = slot.shutdown.send(true);
            if let Err(e) = slot.task.await {
                tracing::error!(projection = %name, error = %e, "Projection task join failed");
            }
        }
    }

    fn spawn(&self, projection: Arc<dyn Projection>) -> Slot {
        let (shutdown, receiver) = watch::channel(false);
        let health = Arc::new(RwLock::new(ProjectionHealth::Running));

        let store = self.store.clone();
        let pool = self.pool.clone();
        let upcasters = self.upcasters.clone();
        let config = self.config.clone();
        let loop_projection = projection.clone();
        let loop_health = health.clone();

        let task = tokio::spawn(async move {
            run_loop(store, pool, upcasters, config, loop_projection, loop_health, receiver).await;
        });

        Slot {
            projection,
            shutdown,
            task,
            health,
        }
    }
}

async fn run_loop(
    store: EventStore,
    pool: PgPool,
    upcasters: Arc<UpcasterChain>,
    config: ProjectionConfig,
    projection: Arc<dyn Projection>,
    health: Arc<RwLock<ProjectionHealth>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let name = projection.name().to_string();
    tracing::info!(projection = %name, "Projection loop started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        match tick(&store, &pool, &upcasters, &config, projection.as_ref()).await {
            Ok(applied) if (applied as i64) < config.batch => {
                sleep_or_shutdown(config.poll_interval, &mut shutdown).await;
            }
            Ok(_) => {}
            Err(e) if e.is_transient() => {
                tracing::warn!(projection = %name, error = %e, "Transient projection error, retrying");
                sleep_or_shutdown(config.poll_interval, &mut shutdown).await;
            }
            Err(e) => {
                tracing::error!(projection = %name, error = %e, "Projection halted");
                if let Ok(mut slot_health) = health.write() {
                    *slot_health = ProjectionHealth::Halted(e.to_string());
                }
                break;
            }
        }
    }

    tracing::info!(projection = %name, "Projection loop stopped");
}

async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = shutdown.changed() => {}
    }
}

/// One batch: read the checkpoint, apply the next envelopes, advance the
/// checkpoint in the same transaction. Returns the number applied.
async fn tick(
    store: &EventStore,
    pool: &PgPool,
    upcasters: &UpcasterChain,
    config: &ProjectionConfig,
    projection: &dyn Projection,
) -> Result<usize, ProjectionError> {
    let name = projection.name();
    let checkpoint = read_checkpoint(pool, name).await?;

    let envelopes: Vec<EventEnvelope> = store
        .load_range(&config.context, checkpoint + 1, config.batch)?
        .try_collect()
        .await?;

    let Some(last) = envelopes.last() else {
        return Ok(0);
    };
    let last_sequence = last.global_sequence;

    let mut tx = pool.begin().await?;

    for envelope in &envelopes {
        let upcasted = upcast_envelope(upcasters, envelope)?;
        projection.apply(&mut tx, &upcasted).await?;
    }

    // The guard keeps the checkpoint monotonic even if a second loop for the
    // same name is ever started by mistake.
    let updated = sqlx::query(
        r#"
        UPDATE projection_checkpoints
        SET last_global_sequence = $2, updated_at = NOW()
        WHERE projection_name = $1 AND last_global_sequence < $2
        "#,
    )
    .bind(name)
    .bind(last_sequence)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if updated == 0 {
        tracing::warn!(
            projection = name,
            sequence = last_sequence,
            "Checkpoint not advanced: a newer checkpoint already exists"
        );
        tx.rollback().await?;
        return Ok(0);
    }

    tx.commit().await?;

    tracing::debug!(
        projection = name,
        applied = envelopes.len(),
        checkpoint = last_sequence,
        "Projection batch applied"
    );

    Ok(envelopes.len())
}

async fn read_checkpoint(pool: &PgPool, name: &str) -> Result<i64, ProjectionError> {
    let checkpoint: Option<i64> = sqlx::query_scalar(
        "SELECT last_global_sequence FROM projection_checkpoints WHERE projection_name = $1",
    )
    .bind(name)
    .fetch_optional(pool)
    .await?;

    Ok(checkpoint.unwrap_or(0))
}

/// Lift the envelope's payload through the upcaster chain
fn upcast_envelope(
    upcasters: &UpcasterChain,
    envelope: &EventEnvelope,
) -> Result<EventEnvelope, ProjectionError> {
    let wrap = |source: CodecError| ProjectionError::Corrupted {
        sequence: envelope.global_sequence,
        source,
    };

    let (event_type, schema_version, data) =
        JsonEventCodec::parts(&envelope.payload).map_err(wrap)?;
    let event_type = event_type.to_string();

    let (schema_version, data) = upcasters
        .upcast(&event_type, schema_version, data)
        .map_err(wrap)?;

    let mut upcasted = envelope.clone();
    upcasted.schema_version = schema_version;
    upcasted.payload = JsonEventCodec::assemble(&event_type, schema_version, data);
    Ok(upcasted)
}
