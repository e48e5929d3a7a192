//! Common test utilities

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use uuid::Uuid;

use event_engine::{Aggregate, AggregateError, DomainEvent, EventSink, OutboxEntry};

const SCHEMA: &str = include_str!("../../migrations/001_schema.sql");

/// Read model table used by the projection tests
const TEST_READ_MODEL: &str = r#"
    CREATE TABLE IF NOT EXISTS projection_balances (
        account_id UUID PRIMARY KEY,
        balance_cents BIGINT NOT NULL DEFAULT 0
    )
"#;

static DB_GATE: OnceLock<Arc<tokio::sync::Mutex<()>>> = OnceLock::new();

/// Exclusive handle on the freshly truncated test database.
///
/// Tests share one database; the gate serializes them so truncation and
/// table-wide assertions cannot interleave.
pub struct TestDb {
    pub pool: PgPool,
    _gate: tokio::sync::OwnedMutexGuard<()>,
}

/// Setup test database - create schema if missing and truncate tables
pub async fn setup_test_db() -> TestDb {
    let gate = DB_GATE
        .get_or_init(|| Arc::new(tokio::sync::Mutex::new(())))
        .clone()
        .lock_owned()
        .await;

    dotenvy::dotenv().ok();
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for tests");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .expect("Failed to connect to DB");

    pool.execute(SCHEMA).await.expect("Failed to apply schema");
    pool.execute(TEST_READ_MODEL)
        .await
        .expect("Failed to create test read model");

    // Clean up DB for fresh state; restart the sequence so global-sequence
    // assertions are deterministic.
    sqlx::query(
        "TRUNCATE TABLE events, snapshots, event_outbox, projection_checkpoints, projection_balances RESTART IDENTITY CASCADE",
    )
    .execute(&pool)
    .await
    .expect("Failed to clean up DB");

    TestDb { pool, _gate: gate }
}

// =========================================================================
// Test fixture aggregate
// =========================================================================

/// Events of the bank-account fixture aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AccountEvent {
    AccountOpened {
        account_id: Uuid,
        owner: String,
        opening_balance_cents: i64,
    },
    MoneyDeposited {
        account_id: Uuid,
        amount_cents: i64,
    },
    MoneyWithdrawn {
        account_id: Uuid,
        amount_cents: i64,
    },
}

impl DomainEvent for AccountEvent {
    fn event_type(&self) -> &'static str {
        match self {
            AccountEvent::AccountOpened { .. } => "AccountOpened",
            AccountEvent::MoneyDeposited { .. } => "MoneyDeposited",
            AccountEvent::MoneyWithdrawn { .. } => "MoneyWithdrawn",
        }
    }

    fn schema_version(&self) -> i32 {
        // AccountOpened grew a renamed balance field; see the upcaster test.
        match self {
            AccountEvent::AccountOpened { .. } => 2,
            _ => 1,
        }
    }

    fn aggregate_id(&self) -> Uuid {
        match self {
            AccountEvent::AccountOpened { account_id, .. } => *account_id,
            AccountEvent::MoneyDeposited { account_id, .. } => *account_id,
            AccountEvent::MoneyWithdrawn { account_id, .. } => *account_id,
        }
    }
}

/// Bank-account fixture aggregate
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestAccount {
    pub owner: String,
    pub balance_cents: i64,
}

impl Aggregate for TestAccount {
    type Event = AccountEvent;

    fn aggregate_type() -> &'static str {
        "TestAccount"
    }

    fn handle(&mut self, event: &Self::Event) -> Result<(), AggregateError> {
        match event {
            AccountEvent::AccountOpened {
                owner,
                opening_balance_cents,
                ..
            } => {
                self.owner = owner.clone();
                self.balance_cents = *opening_balance_cents;
            }
            AccountEvent::MoneyDeposited { amount_cents, .. } => {
                self.balance_cents += amount_cents;
            }
            AccountEvent::MoneyWithdrawn { amount_cents, .. } => {
                self.balance_cents -= amount_cents;
            }
        }
        Ok(())
    }
}

// =========================================================================
// Test sinks
// =========================================================================

/// Records every delivered event id
#[derive(Default)]
pub struct CollectingSink {
    pub delivered: Mutex<Vec<Uuid>>,
}

#[async_trait]
impl EventSink for CollectingSink {
    async fn publish(&self, entry: &OutboxEntry) -> anyhow::Result<()> {
        let event_id = entry
            .event_id()
            .ok_or_else(|| anyhow::anyhow!("outbox entry without event id"))?;
        self.delivered.lock().unwrap().push(event_id);
        Ok(())
    }
}

/// Fails the first N delivery attempts per entry, then succeeds
pub struct FlakySink {
    failures_before_success: i32,
    attempts: Mutex<HashMap<Uuid, i32>>,
    pub delivered: Mutex<Vec<Uuid>>,
}

impl FlakySink {
    pub fn new(failures_before_success: i32) -> Self {
        Self {
            failures_before_success,
            attempts: Mutex::new(HashMap::new()),
            delivered: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl EventSink for FlakySink {
    async fn publish(&self, entry: &OutboxEntry) -> anyhow::Result<()> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let counter = attempts.entry(entry.outbox_id).or_insert(0);
            *counter += 1;
            *counter
        };

        if attempt <= self.failures_before_success {
            anyhow::bail!("sink unavailable (attempt {attempt})");
        }

        let event_id = entry
            .event_id()
            .ok_or_else(|| anyhow::anyhow!("outbox entry without event id"))?;
        self.delivered.lock().unwrap().push(event_id);
        Ok(())
    }
}

/// Rejects every delivery
pub struct RejectingSink;

#[async_trait]
impl EventSink for RejectingSink {
    async fn publish(&self, _entry: &OutboxEntry) -> anyhow::Result<()> {
        anyhow::bail!("sink permanently down")
    }
}
