//! Transactional Outbox & Publisher
//!
//! Outbox rows are inserted by the event store inside the append transaction;
//! there is no try-publish-then-commit path. The publisher ships PENDING rows
//! to a sink and marks them PROCESSED on ack. Delivery is at-least-once:
//! sinks must be idempotent on the event id carried in the row metadata.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Idle backoff never exceeds this, regardless of the poll interval
const IDLE_BACKOFF_MAX: Duration = Duration::from_secs(10);

/// Delivery status of an outbox row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    Processed,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Processed => "PROCESSED",
            OutboxStatus::Failed => "FAILED",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, OutboxError> {
        match raw {
            "PENDING" => Ok(OutboxStatus::Pending),
            "PROCESSED" => Ok(OutboxStatus::Processed),
            "FAILED" => Ok(OutboxStatus::Failed),
            other => Err(OutboxError::InvalidStatus(other.to_string())),
        }
    }
}

/// A staged event awaiting delivery
#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub outbox_id: Uuid,
    pub aggregate_id: Uuid,
    pub event_type: String,
    /// Self-describing codec document
    pub payload: Value,
    pub metadata: Value,
    pub status: OutboxStatus,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub attempt_count: i32,
}

impl OutboxEntry {
    /// Event id this row was staged for; sinks deduplicate on it
    pub fn event_id(&self) -> Option<Uuid> {
        self.metadata
            .get("event_id")
            .and_then(Value::as_str)
            .and_then(|raw| raw.parse().ok())
    }
}

/// Downstream delivery target.
///
/// Implementations must be idempotent on [`OutboxEntry::event_id`]: the
/// publisher guarantees at-least-once, not exactly-once, invocation.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, entry: &OutboxEntry) -> anyhow::Result<()>;
}

/// Publisher tuning knobs
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Rows claimed per pass
    pub batch: i64,
    /// Sleep between passes; also the base of the idle backoff
    pub poll_interval: Duration,
    /// Delivery attempts before a row is marked FAILED
    pub max_attempts: i32,
    /// Restrict delivery to one tenant (strict tenancy deployments)
    pub tenant_filter: Option<String>,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            batch: 100,
            poll_interval: Duration::from_millis(100),
            max_attempts: 5,
            tenant_filter: None,
        }
    }
}

impl OutboxConfig {
    /// Derive the publisher knobs from the engine configuration
    pub fn from_engine(config: &crate::config::EngineConfig) -> Self {
        Self {
            batch: config.outbox_batch,
            poll_interval: config.outbox_poll_interval,
            max_attempts: config.outbox_max_attempts,
            tenant_filter: None,
        }
    }
}

/// Pending/processed/failed row counts
#[derive(Debug, Clone, Copy, Default)]
pub struct OutboxStatusReport {
    pub pending: i64,
    pub processed: i64,
    pub failed: i64,
}

/// Outbox publisher errors
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Unknown outbox status '{0}'")]
    InvalidStatus(String),
}

/// Handle to a running publisher loop
pub struct OutboxPublisherHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl OutboxPublisherHandle {
    /// Signal shutdown and wait for the loop to finish its current entry
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Outbox publisher task join failed");
        }
    }
}

/// Ships PENDING outbox rows to a sink
#[derive(Clone)]
pub struct OutboxPublisher {
    pool: PgPool,
    sink: Arc<dyn EventSink>,
    config: OutboxConfig,
}

impl OutboxPublisher {
    pub fn new(pool: PgPool, sink: Arc<dyn EventSink>, config: OutboxConfig) -> Self {
        Self { pool, sink, config }
    }

    /// Spawn the publisher loop in the background
    pub fn start(&self) -> OutboxPublisherHandle {
        let (shutdown, receiver) = watch::channel(false);
        let publisher = self.clone();

        let task = tokio::spawn(async move {
            publisher.run(receiver).await;
        });

        OutboxPublisherHandle { shutdown, task }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(batch = self.config.batch, "Outbox publisher started");
        let mut idle_delay = self.config.poll_interval;

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.drain_batch(&shutdown).await {
                Ok(0) => {
                    Self::sleep_or_shutdown(idle_delay, &mut shutdown).await;
                    idle_delay = (idle_delay * 2).min(IDLE_BACKOFF_MAX);
                }
                Ok(_) => {
                    idle_delay = self.config.poll_interval;
                }
                Err(e) => {
                    // Transient by assumption; the next pass re-claims.
                    tracing::error!(error = %e, "Outbox pass failed");
                    Self::sleep_or_shutdown(self.config.poll_interval, &mut shutdown).await;
                }
            }
        }

        tracing::info!("Outbox publisher stopped");
    }

    /// Claim one batch and deliver it. Returns the number of claimed rows.
    ///
    /// Claiming uses `FOR UPDATE SKIP LOCKED` so concurrent publisher
    /// instances never double-deliver a row. Marks are written inside the
    /// claim transaction; an entry interrupted by shutdown stays PENDING.
    async fn drain_batch(&self, shutdown: &watch::Receiver<bool>) -> Result<usize, OutboxError> {
        let mut tx = self.pool.begin().await?;

        let rows = match &self.config.tenant_filter {
            Some(tenant) => {
                sqlx::query(
                    r#"
                    SELECT outbox_id, aggregate_id, event_type, event_data, metadata,
                           status, created_at, processed_at, attempt_count
                    FROM event_outbox
                    WHERE status = 'PENDING' AND metadata->>'tenant_id' = $2
                    ORDER BY created_at, outbox_id
                    LIMIT $1
                    FOR UPDATE SKIP LOCKED
                    "#,
                )
                .bind(self.config.batch)
                .bind(tenant)
                .fetch_all(&mut *tx)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT outbox_id, aggregate_id, event_type, event_data, metadata,
                           status, created_at, processed_at, attempt_count
                    FROM event_outbox
                    WHERE status = 'PENDING'
                    ORDER BY created_at, outbox_id
                    LIMIT $1
                    FOR UPDATE SKIP LOCKED
                    "#,
                )
                .bind(self.config.batch)
                .fetch_all(&mut *tx)
                .await?
            }
        };

        let claimed = rows.len();

        for row in &rows {
            if *shutdown.borrow() {
                break;
            }

            let entry = entry_from_row(row)?;
            match self.sink.publish(&entry).await {
                Ok(()) => {
                    sqlx::query(
                        r#"
                        UPDATE event_outbox
                        SET status = 'PROCESSED', processed_at = NOW(),
                            attempt_count = attempt_count + 1
                        WHERE outbox_id = $1
                        "#,
                    )
                    .bind(entry.outbox_id)
                    .execute(&mut *tx)
                    .await?;
                }
                Err(e) => {
                    let attempts = entry.attempt_count + 1;
                    let exhausted = attempts >= self.config.max_attempts;
                    let status = if exhausted {
                        OutboxStatus::Failed
                    } else {
                        OutboxStatus::Pending
                    };

                    sqlx::query(
                        r#"
                        UPDATE event_outbox
                        SET attempt_count = $2, status = $3
                        WHERE outbox_id = $1
                        "#,
                    )
                    .bind(entry.outbox_id)
                    .bind(attempts)
                    .bind(status.as_str())
                    .execute(&mut *tx)
                    .await?;

                    if exhausted {
                        tracing::error!(
                            outbox_id = %entry.outbox_id,
                            event_type = %entry.event_type,
                            attempts,
                            error = %e,
                            "Outbox entry marked FAILED after retry ceiling"
                        );
                    } else {
                        tracing::warn!(
                            outbox_id = %entry.outbox_id,
                            event_type = %entry.event_type,
                            attempts,
                            error = %e,
                            "Sink rejected outbox entry, will retry"
                        );
                    }
                }
            }
        }

        tx.commit().await?;
        Ok(claimed)
    }

    /// Row counts per status
    pub async fn status(&self) -> Result<OutboxStatusReport, OutboxError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM event_outbox GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut report = OutboxStatusReport::default();
        for (status, count) in rows {
            match OutboxStatus::parse(&status)? {
                OutboxStatus::Pending => report.pending = count,
                OutboxStatus::Processed => report.processed = count,
                OutboxStatus::Failed => report.failed = count,
            }
        }

        Ok(report)
    }

    async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {}
        }
    }
}

fn entry_from_row(row: &PgRow) -> Result<OutboxEntry, OutboxError> {
    let status: String = row.try_get("status")?;

    Ok(OutboxEntry {
        outbox_id: row.try_get("outbox_id")?,
        aggregate_id: row.try_get("aggregate_id")?,
        event_type: row.try_get("event_type")?,
        payload: row.try_get("event_data")?,
        metadata: row
            .try_get::<Option<Value>, _>("metadata")?
            .unwrap_or(Value::Null),
        status: OutboxStatus::parse(&status)?,
        created_at: row.try_get("created_at")?,
        processed_at: row.try_get("processed_at")?,
        attempt_count: row.try_get("attempt_count")?,
    })
}
