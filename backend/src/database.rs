use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

use glimmr_shared::JobStatusCount;

use crate::config::{parse, Environment};
use crate::health::DatastoreProbe;

/// Database pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Minimum number of connections to maintain
    pub min_connections: u32,
    /// Maximum time to wait for a connection
    pub acquire_timeout: Duration,
    /// Maximum idle time before a connection is closed
    pub idle_timeout: Duration,
    /// Maximum lifetime of a connection
    pub max_lifetime: Duration,
}

impl PoolConfig {
    /// Profile for `environment`, overridden by `DB_*` environment variables
    pub fn from_env(environment: Environment) -> Self {
        Self::from_lookup(environment, |key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(environment: Environment, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = if environment.is_production() {
            Self::production()
        } else {
            Self::development()
        };
        // Values that do not fit the target type keep the profile default
        let secs = |key: &str| parse::<_, u64>(&lookup, key).map(Duration::from_secs);

        if let Some(n) = parse(&lookup, "DB_MAX_CONNECTIONS") {
            config.max_connections = n;
        }
        if let Some(n) = parse(&lookup, "DB_MIN_CONNECTIONS") {
            config.min_connections = n;
        }
        if let Some(timeout) = secs("DB_ACQUIRE_TIMEOUT") {
            config.acquire_timeout = timeout;
        }
        if let Some(timeout) = secs("DB_IDLE_TIMEOUT") {
            config.idle_timeout = timeout;
        }
        if let Some(lifetime) = secs("DB_MAX_LIFETIME") {
            config.max_lifetime = lifetime;
        }

        config
    }

    /// Short acquire timeout so a stuck database shows up in health quickly
    pub fn production() -> Self {
        Self {
            max_connections: 20,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(3),
            idle_timeout: Duration::from_secs(300),      // 5 minutes
            max_lifetime: Duration::from_secs(3600),     // 1 hour
        }
    }

    pub fn development() -> Self {
        Self {
            max_connections: 5,
            min_connections: 0,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(900),      // 15 minutes
            max_lifetime: Duration::from_secs(7200),     // 2 hours
        }
    }
}

/// Build the pool without connecting. The service only reads job
/// statistics, so an unreachable database must not block startup; the
/// health check reports it instead.
pub fn create_pool(database_url: &str, config: PoolConfig) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .max_lifetime(config.max_lifetime)
        .connect_lazy(database_url)?;

    tracing::info!(
        "Database pool configured: max={}, min={}, acquire_timeout={}s",
        config.max_connections,
        config.min_connections,
        config.acquire_timeout.as_secs()
    );

    Ok(pool)
}

/// Postgres-backed datastore probe
#[derive(Clone)]
pub struct PgDatastore {
    pool: PgPool,
}

impl PgDatastore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl DatastoreProbe for PgDatastore {
    async fn round_trip(&self) -> anyhow::Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn job_status_counts(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<JobStatusCount>> {
        let rows = sqlx::query_as::<_, JobStatusCount>(
            r#"
            SELECT status::TEXT AS status, COUNT(*)::BIGINT AS count
            FROM jobs
            WHERE created_at >= $1
            GROUP BY status
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}
