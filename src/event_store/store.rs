//! Event Store
//!
//! Append-only log of event envelopes with per-aggregate version uniqueness
//! and store-wide monotonic sequencing. Appends write the envelope batch and
//! its outbox rows in one transaction; the commit is the linearization point.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::codec::{CodecError, DomainEvent, JsonEventCodec, VERSION_FIELD};
use crate::config::TenancyConfig;
use crate::context::OperationContext;

use super::EventStoreError;

/// Store-wide advisory lock key. Held from sequence assignment to commit so
/// `global_sequence` values become visible in commit order.
const GLOBAL_ORDER_LOCK: i64 = 0x6576_6E74_5F6C_6F67;

/// Unique constraint enforcing one writer per aggregate version
const VERSION_CONSTRAINT: &str = "events_aggregate_id_aggregate_version_key";

const INSERT_EVENT: &str = r#"
    INSERT INTO events (
        event_id, aggregate_id, aggregate_type, aggregate_version,
        event_type, event_data, metadata
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7)
    RETURNING global_sequence, created_at
"#;

// clock_timestamp() advances inside the transaction, so created_at preserves
// the batch's insert order for the publisher's claim ordering.
const INSERT_OUTBOX: &str = r#"
    INSERT INTO event_outbox (outbox_id, aggregate_id, event_type, event_data, metadata, created_at)
    VALUES ($1, $2, $3, $4, $5, clock_timestamp())
"#;

const SELECT_STREAM: &str = r#"
    SELECT event_id, aggregate_id, aggregate_type, aggregate_version,
           global_sequence, event_type, event_data, metadata, created_at
    FROM events
    WHERE aggregate_id = $1 AND aggregate_type = $2 AND aggregate_version >= $3
    ORDER BY aggregate_version ASC
"#;

const SELECT_STREAM_TENANT: &str = r#"
    SELECT event_id, aggregate_id, aggregate_type, aggregate_version,
           global_sequence, event_type, event_data, metadata, created_at
    FROM events
    WHERE aggregate_id = $1 AND aggregate_type = $2 AND aggregate_version >= $3
      AND metadata->>'tenant_id' = $4
    ORDER BY aggregate_version ASC
"#;

const SELECT_RANGE: &str = r#"
    SELECT event_id, aggregate_id, aggregate_type, aggregate_version,
           global_sequence, event_type, event_data, metadata, created_at
    FROM events
    WHERE global_sequence >= $1
    ORDER BY global_sequence ASC
    LIMIT $2
"#;

const SELECT_RANGE_TENANT: &str = r#"
    SELECT event_id, aggregate_id, aggregate_type, aggregate_version,
           global_sequence, event_type, event_data, metadata, created_at
    FROM events
    WHERE global_sequence >= $1 AND metadata->>'tenant_id' = $3
    ORDER BY global_sequence ASC
    LIMIT $2
"#;

/// Stored event envelope: an event plus positional and provenance metadata
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub aggregate_id: Uuid,
    pub aggregate_type: String,
    pub aggregate_version: i64,
    pub global_sequence: i64,
    pub event_type: String,
    pub schema_version: i32,
    /// Full self-describing codec document
    pub payload: Value,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

impl EventEnvelope {
    /// Tenant recorded at commit, if any
    pub fn tenant_id(&self) -> Option<&str> {
        self.metadata.get("tenant_id").and_then(Value::as_str)
    }
}

/// One event staged for appending
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub event_id: Uuid,
    pub aggregate_id: Uuid,
    pub aggregate_version: i64,
    pub event_type: String,
    pub schema_version: i32,
    /// Self-describing codec document
    pub payload: Value,
    pub publishable: bool,
}

impl NewEvent {
    /// Stage a domain event at the given aggregate version
    pub fn from_domain<E: DomainEvent>(
        aggregate_version: i64,
        event: &E,
    ) -> Result<Self, CodecError> {
        Ok(Self {
            event_id: Uuid::new_v4(),
            aggregate_id: event.aggregate_id(),
            aggregate_version,
            event_type: event.event_type().to_string(),
            schema_version: event.schema_version(),
            payload: JsonEventCodec::encode(event)?,
            publishable: event.publishable(),
        })
    }
}

/// Event store tuning knobs
#[derive(Debug, Clone)]
pub struct EventStoreConfig {
    pub tenancy: TenancyConfig,
    /// Deadline for a whole append; `None` disables the deadline
    pub append_timeout: Option<Duration>,
    /// Bounded retries for transient transport errors
    pub transient_retries: u32,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            tenancy: TenancyConfig::default(),
            append_timeout: Some(Duration::from_secs(5)),
            transient_retries: 3,
        }
    }
}

impl EventStoreConfig {
    /// Derive the store knobs from the engine configuration
    pub fn from_engine(config: &crate::config::EngineConfig) -> Self {
        Self {
            tenancy: config.tenancy(),
            append_timeout: Some(config.append_timeout),
            ..Default::default()
        }
    }
}

/// Event Store for persisting and retrieving event envelopes
#[derive(Debug, Clone)]
pub struct EventStore {
    pool: PgPool,
    config: EventStoreConfig,
}

impl EventStore {
    /// Create a new EventStore with a database pool
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            config: EventStoreConfig::default(),
        }
    }

    /// Create with explicit tuning knobs
    pub fn with_config(pool: PgPool, config: EventStoreConfig) -> Self {
        Self { pool, config }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Atomically append a batch of events for one aggregate.
    ///
    /// Either every event (and its outbox row) is persisted with contiguous
    /// versions and commit-ordered global sequences, or nothing is.
    pub async fn append(
        &self,
        ctx: &OperationContext,
        aggregate_id: Uuid,
        aggregate_type: &str,
        expected_version: i64,
        events: Vec<NewEvent>,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        validate_batch(aggregate_id, expected_version, &events)?;
        let metadata = self.envelope_metadata(ctx)?;

        let attempt_all = self.append_with_retries(
            aggregate_id,
            aggregate_type,
            expected_version,
            &events,
            &metadata,
        );

        match self.config.append_timeout {
            Some(deadline) => tokio::time::timeout(deadline, attempt_all)
                .await
                .map_err(|_| EventStoreError::Timeout { operation: "append" })?,
            None => attempt_all.await,
        }
    }

    async fn append_with_retries(
        &self,
        aggregate_id: Uuid,
        aggregate_type: &str,
        expected_version: i64,
        events: &[NewEvent],
        metadata: &Value,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        let max_attempts = self.config.transient_retries.max(1);
        let mut attempt: u32 = 0;

        loop {
            match self
                .try_append(aggregate_id, aggregate_type, expected_version, events, metadata)
                .await
            {
                Err(EventStoreError::Database(e)) if is_transient(&e) => {
                    attempt += 1;
                    if attempt >= max_attempts {
                        return Err(EventStoreError::Unavailable {
                            attempts: attempt,
                            source: e,
                        });
                    }
                    let delay = Duration::from_millis(50 * attempt as u64);
                    tracing::warn!(
                        error = %e,
                        attempt,
                        "Transient store error during append, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    /// Single append attempt inside one transaction
    async fn try_append(
        &self,
        aggregate_id: Uuid,
        aggregate_type: &str,
        expected_version: i64,
        events: &[NewEvent],
        metadata: &Value,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(GLOBAL_ORDER_LOCK)
            .execute(&mut *tx)
            .await?;

        let mut envelopes = Vec::with_capacity(events.len());

        for event in events {
            let inserted = sqlx::query(INSERT_EVENT)
                .bind(event.event_id)
                .bind(aggregate_id)
                .bind(aggregate_type.to_string())
                .bind(event.aggregate_version)
                .bind(&event.event_type)
                .bind(&event.payload)
                .bind(metadata)
                .fetch_one(&mut *tx)
                .await;

            let row = match inserted {
                Ok(row) => row,
                Err(e) if is_version_conflict(&e) => {
                    tx.rollback().await.ok();
                    let actual = self.highest_version(aggregate_id).await.unwrap_or(0);
                    return Err(EventStoreError::ConcurrencyConflict {
                        aggregate_id,
                        expected: expected_version,
                        actual,
                    });
                }
                Err(e) => return Err(e.into()),
            };

            let global_sequence: i64 = row.try_get("global_sequence")?;
            let created_at: DateTime<Utc> = row.try_get("created_at")?;

            envelopes.push(EventEnvelope {
                event_id: event.event_id,
                aggregate_id,
                aggregate_type: aggregate_type.to_string(),
                aggregate_version: event.aggregate_version,
                global_sequence,
                event_type: event.event_type.clone(),
                schema_version: event.schema_version,
                payload: event.payload.clone(),
                metadata: metadata.clone(),
                created_at,
            });
        }

        for event in events.iter().filter(|e| e.publishable) {
            let mut outbox_metadata = metadata.clone();
            if let Some(object) = outbox_metadata.as_object_mut() {
                object.insert("event_id".to_string(), Value::String(event.event_id.to_string()));
            }

            sqlx::query(INSERT_OUTBOX)
                .bind(Uuid::new_v4())
                .bind(aggregate_id)
                .bind(&event.event_type)
                .bind(&event.payload)
                .bind(outbox_metadata)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        tracing::debug!(
            aggregate_id = %aggregate_id,
            aggregate_type = aggregate_type,
            events = envelopes.len(),
            first_version = expected_version + 1,
            "Appended event batch"
        );

        Ok(envelopes)
    }

    /// Ordered envelopes for one aggregate, ascending by aggregate version.
    ///
    /// The stream is not restartable; re-invoke to retry.
    pub fn load_stream(
        &self,
        ctx: &OperationContext,
        aggregate_id: Uuid,
        aggregate_type: &str,
        from_version: i64,
    ) -> Result<BoxStream<'_, Result<EventEnvelope, EventStoreError>>, EventStoreError> {
        let rows = match self.read_tenant(ctx)? {
            Some(tenant) => sqlx::query(SELECT_STREAM_TENANT)
                .bind(aggregate_id)
                .bind(aggregate_type.to_string())
                .bind(from_version)
                .bind(tenant)
                .fetch(&self.pool),
            None => sqlx::query(SELECT_STREAM)
                .bind(aggregate_id)
                .bind(aggregate_type.to_string())
                .bind(from_version)
                .fetch(&self.pool),
        };

        Ok(rows
            .map(|row| row.map_err(EventStoreError::from).and_then(|r| envelope_from_row(&r)))
            .boxed())
    }

    /// Ordered envelopes across all aggregates, ascending by global sequence,
    /// starting at `from_global_sequence` (inclusive), at most `limit` items.
    pub fn load_range(
        &self,
        ctx: &OperationContext,
        from_global_sequence: i64,
        limit: i64,
    ) -> Result<BoxStream<'_, Result<EventEnvelope, EventStoreError>>, EventStoreError> {
        let rows = match self.read_tenant(ctx)? {
            Some(tenant) => sqlx::query(SELECT_RANGE_TENANT)
                .bind(from_global_sequence)
                .bind(limit)
                .bind(tenant)
                .fetch(&self.pool),
            None => sqlx::query(SELECT_RANGE)
                .bind(from_global_sequence)
                .bind(limit)
                .fetch(&self.pool),
        };

        Ok(rows
            .map(|row| row.map_err(EventStoreError::from).and_then(|r| envelope_from_row(&r)))
            .boxed())
    }

    /// Highest persisted version of an aggregate, or 0 if none
    pub async fn highest_version(&self, aggregate_id: Uuid) -> Result<i64, EventStoreError> {
        let result: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT MAX(aggregate_version) FROM events WHERE aggregate_id = $1
            "#,
        )
        .bind(aggregate_id)
        .fetch_optional(&self.pool)
        .await?
        .flatten();

        Ok(result.unwrap_or(0))
    }

    /// Highest committed global sequence, or 0 on an empty store
    pub async fn highest_global_sequence(&self) -> Result<i64, EventStoreError> {
        let result: Option<i64> =
            sqlx::query_scalar("SELECT MAX(global_sequence) FROM events")
                .fetch_optional(&self.pool)
                .await?
                .flatten();

        Ok(result.unwrap_or(0))
    }

    /// Metadata recorded with every envelope of an append
    fn envelope_metadata(&self, ctx: &OperationContext) -> Result<Value, EventStoreError> {
        let mut object = serde_json::Map::new();

        for (key, value) in &ctx.metadata {
            object.insert(key.clone(), Value::String(value.clone()));
        }
        if let Some(correlation_id) = ctx.correlation_id {
            object.insert(
                "correlation_id".to_string(),
                Value::String(correlation_id.to_string()),
            );
        }
        if let Some(tenant) = self.write_tenant(ctx)? {
            object.insert("tenant_id".to_string(), Value::String(tenant));
        }

        Ok(Value::Object(object))
    }

    /// Tenant recorded on writes whenever tenancy is enabled
    fn write_tenant(&self, ctx: &OperationContext) -> Result<Option<String>, EventStoreError> {
        if !self.config.tenancy.enabled {
            return Ok(None);
        }
        match &ctx.tenant_id {
            Some(tenant) => Ok(Some(tenant.clone())),
            None if self.config.tenancy.strict => Err(EventStoreError::InvalidArgument(
                "tenant id required in strict tenancy mode".to_string(),
            )),
            None => Ok(Some("default".to_string())),
        }
    }

    /// Tenant filter applied to reads in strict mode
    fn read_tenant(&self, ctx: &OperationContext) -> Result<Option<String>, EventStoreError> {
        if self.config.tenancy.enabled && self.config.tenancy.strict {
            self.write_tenant(ctx)
        } else {
            Ok(None)
        }
    }
}

fn validate_batch(
    aggregate_id: Uuid,
    expected_version: i64,
    events: &[NewEvent],
) -> Result<(), EventStoreError> {
    if events.is_empty() {
        return Err(EventStoreError::InvalidArgument("empty event batch".to_string()));
    }
    if expected_version < 0 {
        return Err(EventStoreError::InvalidArgument(format!(
            "negative expected version {expected_version}"
        )));
    }

    let mut seen = HashSet::with_capacity(events.len());
    for (i, event) in events.iter().enumerate() {
        if event.aggregate_id != aggregate_id {
            return Err(EventStoreError::InvalidArgument(format!(
                "event {} belongs to aggregate {}, not {}",
                event.event_id, event.aggregate_id, aggregate_id
            )));
        }
        if !seen.insert(event.event_id) {
            return Err(EventStoreError::InvalidArgument(format!(
                "duplicate event id {} in batch",
                event.event_id
            )));
        }
        let wanted = expected_version + i as i64 + 1;
        if event.aggregate_version != wanted {
            return Err(EventStoreError::InvalidArgument(format!(
                "version gap in batch: event {} carries version {}, expected {}",
                i, event.aggregate_version, wanted
            )));
        }
    }

    Ok(())
}

fn envelope_from_row(row: &PgRow) -> Result<EventEnvelope, EventStoreError> {
    let payload: Value = row.try_get("event_data")?;
    let schema_version = payload
        .get(VERSION_FIELD)
        .and_then(Value::as_i64)
        .unwrap_or(1) as i32;

    Ok(EventEnvelope {
        event_id: row.try_get("event_id")?,
        aggregate_id: row.try_get("aggregate_id")?,
        aggregate_type: row.try_get("aggregate_type")?,
        aggregate_version: row.try_get("aggregate_version")?,
        global_sequence: row.try_get("global_sequence")?,
        event_type: row.try_get("event_type")?,
        schema_version,
        payload,
        metadata: row
            .try_get::<Option<Value>, _>("metadata")?
            .unwrap_or(Value::Null),
        created_at: row.try_get("created_at")?,
    })
}

fn is_version_conflict(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Database(db) if db.constraint() == Some(VERSION_CONSTRAINT)
    )
}

fn is_transient(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type")]
    enum PingEvent {
        Pinged { ping_id: Uuid },
    }

    impl DomainEvent for PingEvent {
        fn event_type(&self) -> &'static str {
            "Pinged"
        }

        fn aggregate_id(&self) -> Uuid {
            match self {
                PingEvent::Pinged { ping_id } => *ping_id,
            }
        }
    }

    fn staged(aggregate_id: Uuid, version: i64) -> NewEvent {
        NewEvent::from_domain(version, &PingEvent::Pinged { ping_id: aggregate_id }).unwrap()
    }

    #[test]
    fn test_from_domain_stages_wire_document() {
        let aggregate_id = Uuid::new_v4();
        let event = staged(aggregate_id, 1);

        assert_eq!(event.aggregate_id, aggregate_id);
        assert_eq!(event.aggregate_version, 1);
        assert_eq!(event.event_type, "Pinged");
        assert_eq!(event.schema_version, 1);
        assert_eq!(event.payload["event_type"], "Pinged");
        assert!(event.publishable);
    }

    #[test]
    fn test_validate_batch_rejects_empty() {
        let err = validate_batch(Uuid::new_v4(), 0, &[]).unwrap_err();
        assert!(matches!(err, EventStoreError::InvalidArgument(_)));
    }

    #[test]
    fn test_validate_batch_rejects_version_gap() {
        let aggregate_id = Uuid::new_v4();
        let events = vec![staged(aggregate_id, 1), staged(aggregate_id, 3)];

        let err = validate_batch(aggregate_id, 0, &events).unwrap_err();
        assert!(matches!(err, EventStoreError::InvalidArgument(_)));
    }

    #[test]
    fn test_validate_batch_rejects_foreign_aggregate() {
        let aggregate_id = Uuid::new_v4();
        let events = vec![staged(Uuid::new_v4(), 1)];

        let err = validate_batch(aggregate_id, 0, &events).unwrap_err();
        assert!(matches!(err, EventStoreError::InvalidArgument(_)));
    }

    #[test]
    fn test_validate_batch_rejects_duplicate_event_id() {
        let aggregate_id = Uuid::new_v4();
        let first = staged(aggregate_id, 1);
        let mut second = staged(aggregate_id, 2);
        second.event_id = first.event_id;

        let err = validate_batch(aggregate_id, 0, &[first, second]).unwrap_err();
        assert!(matches!(err, EventStoreError::InvalidArgument(_)));
    }

    #[test]
    fn test_validate_batch_accepts_contiguous() {
        let aggregate_id = Uuid::new_v4();
        let events = vec![
            staged(aggregate_id, 4),
            staged(aggregate_id, 5),
            staged(aggregate_id, 6),
        ];

        assert!(validate_batch(aggregate_id, 3, &events).is_ok());
    }
}
