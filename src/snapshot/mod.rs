//! Snapshot Store
//!
//! Persists the most recent snapshot per aggregate and serves it for
//! accelerated reconstruction. An optional in-memory cache (bounded, TTL)
//! sits in front of the table; it is best-effort only and a miss is never a
//! correctness failure.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

/// Serialized aggregate state at a known version
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub aggregate_id: Uuid,
    pub aggregate_type: String,
    pub aggregate_version: i64,
    pub state: Value,
    pub created_at: DateTime<Utc>,
}

/// Snapshot cache sizing knobs
#[derive(Debug, Clone)]
pub struct SnapshotCacheConfig {
    pub ttl: Duration,
    pub max_entries: usize,
}

impl Default for SnapshotCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30 * 60),
            max_entries: 1024,
        }
    }
}

impl SnapshotCacheConfig {
    /// Derive the cache knobs from the engine configuration
    pub fn from_engine(config: &crate::config::EngineConfig) -> Self {
        Self {
            ttl: config.snapshot_cache_ttl,
            max_entries: config.snapshot_cache_size,
        }
    }
}

/// Snapshot store errors
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Snapshot Store for persisting and retrieving aggregate snapshots
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    pool: PgPool,
    cache: Option<Arc<SnapshotCache>>,
}

impl SnapshotStore {
    /// Create a store without a cache
    pub fn new(pool: PgPool) -> Self {
        Self { pool, cache: None }
    }

    /// Create a store fronted by a bounded in-memory cache
    pub fn with_cache(pool: PgPool, config: SnapshotCacheConfig) -> Self {
        Self {
            pool,
            cache: Some(Arc::new(SnapshotCache::new(config))),
        }
    }

    /// Upsert the snapshot for its aggregate
    pub async fn save(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        // Invalidate before persisting so a failed write cannot leave a
        // stale entry behind.
        if let Some(cache) = &self.cache {
            cache.invalidate(&snapshot.aggregate_type, snapshot.aggregate_id);
        }

        sqlx::query(
            r#"
            INSERT INTO snapshots (aggregate_id, aggregate_type, aggregate_version, snapshot_data)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (aggregate_id, aggregate_type)
            DO UPDATE SET aggregate_version = $3, snapshot_data = $4, created_at = NOW()
            "#,
        )
        .bind(snapshot.aggregate_id)
        .bind(&snapshot.aggregate_type)
        .bind(snapshot.aggregate_version)
        .bind(&snapshot.state)
        .execute(&self.pool)
        .await?;

        if let Some(cache) = &self.cache {
            cache.insert(snapshot.clone());
        }

        tracing::info!(
            aggregate_type = %snapshot.aggregate_type,
            aggregate_id = %snapshot.aggregate_id,
            version = snapshot.aggregate_version,
            "Snapshot saved"
        );

        Ok(())
    }

    /// Latest snapshot for an aggregate, or `None`
    pub async fn load(
        &self,
        aggregate_type: &str,
        aggregate_id: Uuid,
    ) -> Result<Option<Snapshot>, SnapshotError> {
        if let Some(cache) = &self.cache {
            if let Some(snapshot) = cache.get(aggregate_type, aggregate_id) {
                return Ok(Some(snapshot));
            }
        }

        let row: Option<(i64, Value, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT aggregate_version, snapshot_data, created_at
            FROM snapshots
            WHERE aggregate_id = $1 AND aggregate_type = $2
            "#,
        )
        .bind(aggregate_id)
        .bind(aggregate_type)
        .fetch_optional(&self.pool)
        .await?;

        let snapshot = row.map(|(aggregate_version, state, created_at)| Snapshot {
            aggregate_id,
            aggregate_type: aggregate_type.to_string(),
            aggregate_version,
            state,
            created_at,
        });

        if let (Some(cache), Some(snapshot)) = (&self.cache, &snapshot) {
            cache.insert(snapshot.clone());
        }

        Ok(snapshot)
    }

    /// Remove the snapshot for an aggregate
    pub async fn delete(
        &self,
        aggregate_type: &str,
        aggregate_id: Uuid,
    ) -> Result<(), SnapshotError> {
        if let Some(cache) = &self.cache {
            cache.invalidate(aggregate_type, aggregate_id);
        }

        sqlx::query("DELETE FROM snapshots WHERE aggregate_id = $1 AND aggregate_type = $2")
            .bind(aggregate_id)
            .bind(aggregate_type)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

/// Thread-safe bounded snapshot cache with TTL
#[derive(Debug)]
struct SnapshotCache {
    config: SnapshotCacheConfig,
    entries: Mutex<HashMap<(String, Uuid), CachedSnapshot>>,
}

#[derive(Debug)]
struct CachedSnapshot {
    snapshot: Snapshot,
    inserted_at: Instant,
}

impl SnapshotCache {
    fn new(config: SnapshotCacheConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn get(&self, aggregate_type: &str, aggregate_id: Uuid) -> Option<Snapshot> {
        let key = (aggregate_type.to_string(), aggregate_id);
        let mut entries = self.entries.lock().ok()?;

        match entries.get(&key) {
            Some(cached) if cached.inserted_at.elapsed() < self.config.ttl => {
                Some(cached.snapshot.clone())
            }
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    fn insert(&self, snapshot: Snapshot) {
        if self.config.max_entries == 0 {
            return;
        }
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };

        let key = (snapshot.aggregate_type.clone(), snapshot.aggregate_id);
        if entries.len() >= self.config.max_entries && !entries.contains_key(&key) {
            // Evict the oldest entry to stay within bounds.
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, cached)| cached.inserted_at)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest);
            }
        }

        entries.insert(
            key,
            CachedSnapshot {
                snapshot,
                inserted_at: Instant::now(),
            },
        );
    }

    fn invalidate(&self, aggregate_type: &str, aggregate_id: Uuid) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(&(aggregate_type.to_string(), aggregate_id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(aggregate_id: Uuid, version: i64) -> Snapshot {
        Snapshot {
            aggregate_id,
            aggregate_type: "TestAccount".to_string(),
            aggregate_version: version,
            state: serde_json::json!({ "balance": version }),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_cache_hit_and_invalidate() {
        let cache = SnapshotCache::new(SnapshotCacheConfig::default());
        let aggregate_id = Uuid::new_v4();

        cache.insert(snapshot(aggregate_id, 3));
        let hit = cache.get("TestAccount", aggregate_id).unwrap();
        assert_eq!(hit.aggregate_version, 3);

        cache.invalidate("TestAccount", aggregate_id);
        assert!(cache.get("TestAccount", aggregate_id).is_none());
    }

    #[test]
    fn test_cache_expires_entries() {
        let cache = SnapshotCache::new(SnapshotCacheConfig {
            ttl: Duration::from_millis(0),
            max_entries: 16,
        });
        let aggregate_id = Uuid::new_v4();

        cache.insert(snapshot(aggregate_id, 1));
        assert!(cache.get("TestAccount", aggregate_id).is_none());
    }

    #[test]
    fn test_cache_bounds_size() {
        let cache = SnapshotCache::new(SnapshotCacheConfig {
            ttl: Duration::from_secs(60),
            max_entries: 2,
        });

        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let third = Uuid::new_v4();

        cache.insert(snapshot(first, 1));
        cache.insert(snapshot(second, 2));
        cache.insert(snapshot(third, 3));

        let alive = [first, second, third]
            .iter()
            .filter(|id| cache.get("TestAccount", **id).is_some())
            .count();
        assert_eq!(alive, 2);
        // The oldest entry is the one evicted.
        assert!(cache.get("TestAccount", first).is_none());
    }
}
