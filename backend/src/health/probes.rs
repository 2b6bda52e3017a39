use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use glimmr_shared::{JobCounts, JobStatusCount};

use crate::pool::{ConnectionPoolManager, ConnectionStatus, DEFAULT_CONNECTION};

/// Relational datastore: round trip and recent job throughput
#[async_trait]
pub trait DatastoreProbe: Send + Sync {
    async fn round_trip(&self) -> anyhow::Result<()>;

    /// Jobs created since `since`, grouped by status
    async fn job_status_counts(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<JobStatusCount>>;
}

/// Backing store as seen by the health check
#[async_trait]
pub trait CacheProbe: Send + Sync {
    async fn ping(&self) -> anyhow::Result<String>;

    async fn connection_statuses(&self) -> BTreeMap<String, ConnectionStatus>;
}

#[async_trait]
pub trait StorageProbe: Send + Sync {
    /// List at most `max_keys` objects under the probe prefix
    async fn list_probe_prefix(&self, max_keys: usize) -> anyhow::Result<usize>;
}

#[async_trait]
pub trait QueueProbe: Send + Sync {
    fn queue_names(&self) -> Vec<String>;

    async fn job_counts(&self, queue: &str) -> anyhow::Result<JobCounts>;
}

#[async_trait]
impl CacheProbe for ConnectionPoolManager {
    async fn ping(&self) -> anyhow::Result<String> {
        let conn = self.get_connection(DEFAULT_CONNECTION).await;
        Ok(conn.ping().await?)
    }

    async fn connection_statuses(&self) -> BTreeMap<String, ConnectionStatus> {
        self.statuses().await
    }
}
