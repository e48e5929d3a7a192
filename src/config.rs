//! Configuration module
//!
//! Loads engine configuration from environment variables.

use std::env;
use std::time::Duration;

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Database connection URL
    pub database_url: String,

    /// Maximum database connections in pool
    pub database_max_connections: u32,

    /// Events between snapshots; `0` disables snapshotting
    pub snapshot_threshold: i64,

    /// Snapshot cache entry lifetime
    pub snapshot_cache_ttl: Duration,

    /// Maximum number of cached snapshots
    pub snapshot_cache_size: usize,

    /// Maximum conflict retries at the command boundary
    pub retry_max: u32,

    /// Base delay for exponential backoff between conflict retries
    pub retry_base_delay: Duration,

    /// Events fetched per projection tick
    pub projection_batch: i64,

    /// Sleep between projection ticks that come back short
    pub projection_poll_interval: Duration,

    /// Outbox rows claimed per publisher pass
    pub outbox_batch: i64,

    /// Sleep between publisher passes
    pub outbox_poll_interval: Duration,

    /// Delivery attempts before an outbox row is marked FAILED
    pub outbox_max_attempts: i32,

    /// Whether a tenant is resolved and recorded for each operation
    pub tenancy_enabled: bool,

    /// When true, a missing tenant is an error; otherwise "default" is used
    pub tenancy_strict: bool,

    /// Whether the upcaster chain runs on decode
    pub upcasting_enabled: bool,

    /// Whether [`crate::telemetry::init`] installs a subscriber
    pub tracing_enabled: bool,

    /// Deadline for a single append; exceeding it surfaces as a timeout
    pub append_timeout: Duration,
}

impl EngineConfig {
    /// Configuration with defaults for everything except the database URL
    pub fn with_database_url(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            database_max_connections: 10,
            snapshot_threshold: 50,
            snapshot_cache_ttl: Duration::from_secs(30 * 60),
            snapshot_cache_size: 1024,
            retry_max: 3,
            retry_base_delay: Duration::from_millis(100),
            projection_batch: 100,
            projection_poll_interval: Duration::from_millis(500),
            outbox_batch: 100,
            outbox_poll_interval: Duration::from_millis(100),
            outbox_max_attempts: 5,
            tenancy_enabled: false,
            tenancy_strict: false,
            upcasting_enabled: true,
            tracing_enabled: true,
            append_timeout: Duration::from_secs(5),
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            env::var("DATABASE_URL").map_err(|_| ConfigError::MissingEnv("DATABASE_URL"))?;

        let mut config = Self::with_database_url(database_url);

        config.database_max_connections =
            parse_env("DATABASE_MAX_CONNECTIONS", config.database_max_connections)?;
        config.snapshot_threshold = parse_env("SNAPSHOT_THRESHOLD", config.snapshot_threshold)?;
        config.snapshot_cache_ttl = Duration::from_secs(parse_env(
            "SNAPSHOT_CACHE_TTL_SECS",
            config.snapshot_cache_ttl.as_secs(),
        )?);
        config.snapshot_cache_size = parse_env("SNAPSHOT_CACHE_SIZE", config.snapshot_cache_size)?;
        config.retry_max = parse_env("RETRY_MAX", config.retry_max)?;
        config.retry_base_delay = Duration::from_millis(parse_env(
            "RETRY_BASE_DELAY_MS",
            config.retry_base_delay.as_millis() as u64,
        )?);
        config.projection_batch = parse_env("PROJECTION_BATCH", config.projection_batch)?;
        config.projection_poll_interval = Duration::from_millis(parse_env(
            "PROJECTION_POLL_INTERVAL_MS",
            config.projection_poll_interval.as_millis() as u64,
        )?);
        config.outbox_batch = parse_env("OUTBOX_BATCH", config.outbox_batch)?;
        config.outbox_poll_interval = Duration::from_millis(parse_env(
            "OUTBOX_POLL_INTERVAL_MS",
            config.outbox_poll_interval.as_millis() as u64,
        )?);
        config.outbox_max_attempts = parse_env("OUTBOX_MAX_ATTEMPTS", config.outbox_max_attempts)?;
        config.tenancy_enabled = parse_env("TENANCY_ENABLED", config.tenancy_enabled)?;
        config.tenancy_strict = parse_env("TENANCY_STRICT", config.tenancy_strict)?;
        config.upcasting_enabled = parse_env("UPCASTING_ENABLED", config.upcasting_enabled)?;
        config.tracing_enabled = parse_env("TRACING_ENABLED", config.tracing_enabled)?;
        config.append_timeout = Duration::from_millis(parse_env(
            "APPEND_TIMEOUT_MS",
            config.append_timeout.as_millis() as u64,
        )?);

        Ok(config)
    }

    /// Tenancy knobs for read/write paths
    pub fn tenancy(&self) -> TenancyConfig {
        TenancyConfig {
            enabled: self.tenancy_enabled,
            strict: self.tenancy_strict,
        }
    }
}

/// Tenancy resolution mode
#[derive(Debug, Clone, Copy, Default)]
pub struct TenancyConfig {
    pub enabled: bool,
    pub strict: bool,
}

fn parse_env<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue(name)),
        Err(_) => Ok(default),
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::with_database_url("postgres://localhost/test");

        assert_eq!(config.snapshot_threshold, 50);
        assert_eq!(config.snapshot_cache_ttl, Duration::from_secs(1800));
        assert_eq!(config.retry_max, 3);
        assert_eq!(config.retry_base_delay, Duration::from_millis(100));
        assert_eq!(config.projection_batch, 100);
        assert_eq!(config.outbox_max_attempts, 5);
        assert!(!config.tenancy_enabled);
        assert!(config.upcasting_enabled);
    }

    #[test]
    fn test_tenancy_view() {
        let mut config = EngineConfig::with_database_url("postgres://localhost/test");
        config.tenancy_enabled = true;
        config.tenancy_strict = true;

        let tenancy = config.tenancy();
        assert!(tenancy.enabled);
        assert!(tenancy.strict);
    }
}
