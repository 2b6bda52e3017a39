//! Composite health of the service and its dependencies
//!
//! Every probe runs concurrently and is isolated: an error or panic turns
//! into a `down` component instead of failing the whole check. The overall
//! status follows the worst component.

pub mod handlers;
pub mod probes;

use futures::FutureExt;
use serde_json::json;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, warn};

use glimmr_shared::{ComponentHealth, ComponentStatus, HealthCheckResult, HealthStatus, JobCounts};

pub use handlers::health_routes;
pub use probes::{CacheProbe, DatastoreProbe, QueueProbe, StorageProbe};

use crate::pool::ConnectionStatus;

pub mod components {
    pub const DATABASE: &str = "database";
    pub const REDIS: &str = "redis";
    pub const STORAGE: &str = "storage";
    pub const QUEUES: &str = "queues";
    pub const JOBS: &str = "jobs";
}

const EXPECTED_PING_REPLY: &str = "PONG";

#[derive(Debug, Clone)]
pub struct HealthThresholds {
    pub database_latency: Duration,
    pub cache_latency: Duration,
    pub storage_latency: Duration,
    pub max_stalled_jobs: u64,
    pub max_failed_jobs: u64,
    /// Failed-to-completed ratio tolerated over the throughput window
    pub max_failure_ratio: f64,
    pub throughput_window: Duration,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            database_latency: Duration::from_millis(1000),
            cache_latency: Duration::from_millis(100),
            storage_latency: Duration::from_millis(2000),
            max_stalled_jobs: 10,
            max_failed_jobs: 100,
            max_failure_ratio: 0.2,
            throughput_window: Duration::from_secs(3600),
        }
    }
}

pub struct HealthAggregator {
    datastore: Arc<dyn DatastoreProbe>,
    cache: Arc<dyn CacheProbe>,
    storage: Arc<dyn StorageProbe>,
    queues: Arc<dyn QueueProbe>,
    thresholds: HealthThresholds,
    started_at: Instant,
}

impl HealthAggregator {
    pub fn new(
        datastore: Arc<dyn DatastoreProbe>,
        cache: Arc<dyn CacheProbe>,
        storage: Arc<dyn StorageProbe>,
        queues: Arc<dyn QueueProbe>,
    ) -> Self {
        Self {
            datastore,
            cache,
            storage,
            queues,
            thresholds: HealthThresholds::default(),
            started_at: Instant::now(),
        }
    }

    pub fn with_thresholds(mut self, thresholds: HealthThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub async fn check_health(&self) -> HealthCheckResult {
        let (database, redis, storage, queues, jobs) = tokio::join!(
            guarded(components::DATABASE, self.check_database()),
            guarded(components::REDIS, self.check_cache()),
            guarded(components::STORAGE, self.check_storage()),
            guarded(components::QUEUES, self.check_queues()),
            guarded(components::JOBS, self.check_job_throughput()),
        );

        let checks = BTreeMap::from([
            (components::DATABASE.to_string(), database),
            (components::REDIS.to_string(), redis),
            (components::STORAGE.to_string(), storage),
            (components::QUEUES.to_string(), queues),
            (components::JOBS.to_string(), jobs),
        ]);

        let result = HealthCheckResult::new(checks, self.uptime().as_secs_f64());
        if result.status != HealthStatus::Healthy {
            let failing: Vec<&str> = result
                .checks
                .iter()
                .filter(|(_, check)| check.status != ComponentStatus::Up)
                .map(|(name, _)| name.as_str())
                .collect();
            warn!(status = result.status.as_str(), ?failing, "Service health is not healthy");
        }
        result
    }

    /// Critical dependencies only. Any failure reads as not ready.
    pub async fn is_ready(&self) -> bool {
        let (database, redis) = tokio::join!(
            guarded(components::DATABASE, self.check_database()),
            guarded(components::REDIS, self.check_cache()),
        );
        !database.is_down() && !redis.is_down()
    }

    pub fn is_alive(&self) -> bool {
        true
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    async fn check_database(&self) -> anyhow::Result<ComponentHealth> {
        let started = Instant::now();
        self.datastore.round_trip().await?;
        Ok(latency_verdict(
            "Database",
            started.elapsed(),
            self.thresholds.database_latency,
        ))
    }

    async fn check_cache(&self) -> anyhow::Result<ComponentHealth> {
        let started = Instant::now();
        let reply = self.cache.ping().await?;
        let latency = started.elapsed();
        let latency_ms = latency.as_millis() as u64;

        let mut health = if reply != EXPECTED_PING_REPLY {
            ComponentHealth::degraded(format!("Unexpected PING reply: {}", reply))
        } else if latency >= self.thresholds.cache_latency {
            ComponentHealth::degraded(format!("Redis responding slowly ({}ms)", latency_ms))
        } else {
            ComponentHealth::up()
        };

        let statuses = self.cache.connection_statuses().await;
        let unhealthy = statuses
            .values()
            .filter(|status| **status != ConnectionStatus::Ready)
            .count();
        if unhealthy > 0 {
            health.status = ComponentStatus::Degraded;
            health.message = Some(format!("{} connection(s) not ready", unhealthy));
        }

        Ok(health.with_latency(latency_ms).with_details(json!({
            "connections": statuses,
            "unhealthyConnections": unhealthy,
        })))
    }

    async fn check_storage(&self) -> anyhow::Result<ComponentHealth> {
        let started = Instant::now();
        let listed = self.storage.list_probe_prefix(1).await?;
        Ok(latency_verdict(
            "Object storage",
            started.elapsed(),
            self.thresholds.storage_latency,
        )
        .with_details(json!({ "objectsListed": listed })))
    }

    async fn check_queues(&self) -> anyhow::Result<ComponentHealth> {
        let names = self.queues.queue_names();
        let counts = futures::future::try_join_all(names.iter().map(|queue| async move {
            let counts = self.queues.job_counts(queue).await?;
            Ok::<_, anyhow::Error>((queue.clone(), counts))
        }))
        .await?;

        let mut totals = JobCounts::default();
        for (_, queue_counts) in &counts {
            totals += *queue_counts;
        }

        let thresholds = &self.thresholds;
        let health = if totals.stalled > thresholds.max_stalled_jobs {
            ComponentHealth::degraded(format!("{} stalled jobs", totals.stalled))
        } else if totals.failed > thresholds.max_failed_jobs {
            ComponentHealth::degraded(format!("{} failed jobs", totals.failed))
        } else {
            ComponentHealth::up()
        };

        let per_queue: BTreeMap<String, JobCounts> = counts.into_iter().collect();
        Ok(health.with_details(json!({ "queues": per_queue, "totals": totals })))
    }

    async fn check_job_throughput(&self) -> anyhow::Result<ComponentHealth> {
        let window = chrono::Duration::from_std(self.thresholds.throughput_window)?;
        let rows = self
            .datastore
            .job_status_counts(chrono::Utc::now() - window)
            .await?;

        let count = |status: &str| -> i64 {
            rows.iter()
                .filter(|row| row.status == status)
                .map(|row| row.count)
                .sum()
        };
        let completed = count("completed");
        let failed = count("failed");

        let failure_rate = if completed > 0 {
            failed as f64 / completed as f64
        } else {
            0.0
        };

        let health = if completed > 0 && failure_rate > self.thresholds.max_failure_ratio {
            ComponentHealth::degraded(format!(
                "High failure rate: {} failed vs {} completed in the last hour",
                failed, completed
            ))
        } else {
            ComponentHealth::up()
        };

        let by_status: BTreeMap<&str, i64> =
            rows.iter().map(|row| (row.status.as_str(), row.count)).collect();
        Ok(health.with_details(json!({
            "lastHour": by_status,
            "failureRate": failure_rate,
        })))
    }
}

fn latency_verdict(label: &str, latency: Duration, threshold: Duration) -> ComponentHealth {
    let latency_ms = latency.as_millis() as u64;
    if latency < threshold {
        ComponentHealth::up().with_latency(latency_ms)
    } else {
        ComponentHealth::degraded(format!("{} responding slowly ({}ms)", label, latency_ms))
            .with_latency(latency_ms)
    }
}

/// Run one probe, turning errors and panics into a `down` component
async fn guarded<F>(component: &'static str, check: F) -> ComponentHealth
where
    F: Future<Output = anyhow::Result<ComponentHealth>>,
{
    match AssertUnwindSafe(check).catch_unwind().await {
        Ok(Ok(health)) => health,
        Ok(Err(e)) => {
            warn!(component, error = %format!("{:#}", e), "Health check failed");
            ComponentHealth::down(format!("{:#}", e))
        }
        Err(_) => {
            error!(component, "Health check panicked");
            ComponentHealth::down("Health check panicked")
        }
    }
}
