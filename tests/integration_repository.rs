//! Integration tests for the Repository (command boundary)

use std::sync::Arc;

use event_engine::{
    EventStore, OperationContext, Repository, RepositoryConfig, SnapshotCacheConfig,
    SnapshotStore, UpcasterChain,
};
use uuid::Uuid;

mod common;

use common::{AccountEvent, TestAccount};

fn repository(pool: &sqlx::PgPool, upcasters: UpcasterChain) -> Repository<TestAccount> {
    Repository::new(
        EventStore::new(pool.clone()),
        SnapshotStore::with_cache(pool.clone(), SnapshotCacheConfig::default()),
        Arc::new(upcasters),
        RepositoryConfig::default(),
    )
}

async fn stored_versions(pool: &sqlx::PgPool, account_id: Uuid) -> Vec<i64> {
    sqlx::query_scalar(
        "SELECT aggregate_version FROM events WHERE aggregate_id = $1 ORDER BY aggregate_version",
    )
    .bind(account_id)
    .fetch_all(pool)
    .await
    .unwrap()
}

#[tokio::test]
async fn test_happy_path_save_and_reload() {
    let db = common::setup_test_db().await;
    let repo = repository(&db.pool, UpcasterChain::new());
    let ctx = OperationContext::new();

    let account_id = Uuid::new_v4();
    let mut root = repo.load(&ctx, account_id).await.unwrap();
    assert!(root.is_new());

    root.apply(AccountEvent::AccountOpened {
        account_id,
        owner: "A1".to_string(),
        opening_balance_cents: 1000,
    })
    .unwrap();
    root.apply(AccountEvent::MoneyDeposited {
        account_id,
        amount_cents: 200,
    })
    .unwrap();
    root.apply(AccountEvent::MoneyWithdrawn {
        account_id,
        amount_cents: 50,
    })
    .unwrap();

    let envelopes = repo.save(&ctx, &mut root).await.unwrap();
    assert_eq!(envelopes.len(), 3);
    assert_eq!(root.uncommitted_len(), 0);

    assert_eq!(stored_versions(&db.pool, account_id).await, vec![1, 2, 3]);

    let reloaded = repo.load(&ctx, account_id).await.unwrap();
    assert_eq!(reloaded.version(), 3);
    assert_eq!(reloaded.state().balance_cents, 1150);
    assert_eq!(reloaded.state().owner, "A1");

    let pending: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM event_outbox WHERE status = 'PENDING'")
            .fetch_one(&db.pool)
            .await
            .unwrap();
    assert_eq!(pending, 3);
}

#[tokio::test]
async fn test_save_without_pending_events_is_a_noop() {
    let db = common::setup_test_db().await;
    let repo = repository(&db.pool, UpcasterChain::new());
    let ctx = OperationContext::new();

    let mut root = repo.load(&ctx, Uuid::new_v4()).await.unwrap();
    let envelopes = repo.save(&ctx, &mut root).await.unwrap();
    assert!(envelopes.is_empty());
}

#[tokio::test]
async fn test_optimistic_conflict_one_winner_then_retry() {
    let db = common::setup_test_db().await;
    let repo = repository(&db.pool, UpcasterChain::new());
    let ctx = OperationContext::new();

    let account_id = Uuid::new_v4();

    // Seed the aggregate at version 3.
    let mut root = repo.load(&ctx, account_id).await.unwrap();
    root.apply(AccountEvent::AccountOpened {
        account_id,
        owner: "A1".to_string(),
        opening_balance_cents: 1000,
    })
    .unwrap();
    root.apply(AccountEvent::MoneyDeposited {
        account_id,
        amount_cents: 200,
    })
    .unwrap();
    root.apply(AccountEvent::MoneyWithdrawn {
        account_id,
        amount_cents: 50,
    })
    .unwrap();
    repo.save(&ctx, &mut root).await.unwrap();

    // Two workers load the same version and both try to deposit.
    let mut worker_a = repo.load(&ctx, account_id).await.unwrap();
    let mut worker_b = repo.load(&ctx, account_id).await.unwrap();
    assert_eq!(worker_a.version(), 3);
    assert_eq!(worker_b.version(), 3);

    worker_a
        .apply(AccountEvent::MoneyDeposited {
            account_id,
            amount_cents: 10,
        })
        .unwrap();
    worker_b
        .apply(AccountEvent::MoneyDeposited {
            account_id,
            amount_cents: 10,
        })
        .unwrap();

    repo.save(&ctx, &mut worker_a).await.unwrap();

    let err = repo.save(&ctx, &mut worker_b).await.unwrap_err();
    assert!(err.is_concurrency_conflict());

    // The loser re-executes through the retrying command boundary and lands
    // on version 5.
    let root = repo
        .execute(&ctx, account_id, |root| {
            root.apply(AccountEvent::MoneyDeposited {
                account_id,
                amount_cents: 10,
            })?;
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(root.version(), 5);
    assert_eq!(root.state().balance_cents, 1170);
    assert_eq!(stored_versions(&db.pool, account_id).await, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_snapshot_threshold_schedule() {
    let db = common::setup_test_db().await;
    let repo = repository(&db.pool, UpcasterChain::new());
    let ctx = OperationContext::new();

    let account_id = Uuid::new_v4();

    repo.execute(&ctx, account_id, |root| {
        root.apply(AccountEvent::AccountOpened {
            account_id,
            owner: "A1".to_string(),
            opening_balance_cents: 0,
        })?;
        Ok(())
    })
    .await
    .unwrap();

    for _ in 0..119 {
        repo.execute(&ctx, account_id, |root| {
            root.apply(AccountEvent::MoneyDeposited {
                account_id,
                amount_cents: 10,
            })?;
            Ok(())
        })
        .await
        .unwrap();
    }

    // Threshold 50 over 120 events snapshots at v50 and again at v100.
    let snapshot_version: i64 = sqlx::query_scalar(
        "SELECT aggregate_version FROM snapshots WHERE aggregate_id = $1 AND aggregate_type = 'TestAccount'",
    )
    .bind(account_id)
    .fetch_one(&db.pool)
    .await
    .unwrap();
    assert_eq!(snapshot_version, 100);

    // Snapshot-accelerated load equals the pure event replay.
    let from_snapshot = repo.load(&ctx, account_id).await.unwrap();
    assert_eq!(from_snapshot.version(), 120);
    assert_eq!(from_snapshot.state().balance_cents, 1190);

    let snapshots = SnapshotStore::new(db.pool.clone());
    snapshots.delete("TestAccount", account_id).await.unwrap();

    let replay_only_repo = repository(&db.pool, UpcasterChain::new());
    let from_events = replay_only_repo.load(&ctx, account_id).await.unwrap();
    assert_eq!(from_events.version(), from_snapshot.version());
    assert_eq!(from_events.state(), from_snapshot.state());
}

#[tokio::test]
async fn test_upcaster_chain_lifts_legacy_payloads() {
    let db = common::setup_test_db().await;
    let ctx = OperationContext::new();
    let account_id = Uuid::new_v4();

    // A legacy AccountOpened row, written before the balance field was
    // renamed to opening_balance_cents.
    let legacy = event_engine::NewEvent {
        event_id: Uuid::new_v4(),
        aggregate_id: account_id,
        aggregate_version: 1,
        event_type: "AccountOpened".to_string(),
        schema_version: 1,
        payload: serde_json::json!({
            "event_type": "AccountOpened",
            "schema_version": 1,
            "data": {
                "type": "AccountOpened",
                "account_id": account_id,
                "owner": "A1",
                "opening_balance": 77
            }
        }),
        publishable: true,
    };

    let store = EventStore::new(db.pool.clone());
    store
        .append(&ctx, account_id, "TestAccount", 0, vec![legacy])
        .await
        .unwrap();

    let mut upcasters = UpcasterChain::new();
    upcasters
        .register("AccountOpened", 1, 2, |mut data| {
            data["opening_balance_cents"] = data["opening_balance"].clone();
            if let Some(object) = data.as_object_mut() {
                object.remove("opening_balance");
            }
            data
        })
        .unwrap();

    let repo = repository(&db.pool, upcasters);

    // A current-schema event on top of the legacy one.
    repo.execute(&ctx, account_id, |root| {
        root.apply(AccountEvent::MoneyDeposited {
            account_id,
            amount_cents: 3,
        })?;
        Ok(())
    })
    .await
    .unwrap();

    let root = repo.load(&ctx, account_id).await.unwrap();
    assert_eq!(root.version(), 2);
    assert_eq!(root.state().owner, "A1");
    assert_eq!(root.state().balance_cents, 80);
}
