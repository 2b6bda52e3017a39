use async_trait::async_trait;
use std::sync::Arc;

use glimmr_shared::JobCounts;

use crate::config::QueueConfig;
use crate::health::QueueProbe;
use crate::pool::{ConnectionPoolManager, QUEUE_CONNECTION};

/// Reads all counters of one queue in a single round trip. Missing keys
/// count as zero.
const COUNTS_SCRIPT: &str = r#"
return {
  redis.call('LLEN', KEYS[1]),
  redis.call('LLEN', KEYS[2]),
  redis.call('LLEN', KEYS[3]),
  redis.call('ZCARD', KEYS[4]),
  redis.call('ZCARD', KEYS[5]),
  redis.call('ZCARD', KEYS[6]),
  redis.call('SCARD', KEYS[7]),
  redis.call('ZCARD', KEYS[8])
}
"#;

/// Key suffixes, in script order
const COUNT_KEYS: [&str; 8] = [
    "wait",
    "active",
    "paused",
    "completed",
    "failed",
    "delayed",
    "stalled",
    "prioritized",
];

/// Job counts read from the queue library's key layout
pub struct RedisQueueMetrics {
    pool: Arc<ConnectionPoolManager>,
    prefix: String,
    queues: Vec<String>,
}

impl RedisQueueMetrics {
    pub fn new(pool: Arc<ConnectionPoolManager>, config: &QueueConfig) -> Self {
        Self {
            pool,
            prefix: config.prefix.clone(),
            queues: config.names.clone(),
        }
    }

    pub fn counts_command(&self, queue: &str) -> redis::Cmd {
        let mut cmd = redis::cmd("EVAL");
        cmd.arg(COUNTS_SCRIPT).arg(COUNT_KEYS.len());
        for suffix in COUNT_KEYS {
            cmd.arg(queue_key(&self.prefix, queue, suffix));
        }
        cmd
    }
}

pub fn queue_key(prefix: &str, queue: &str, suffix: &str) -> String {
    format!("{}:{}:{}", prefix, queue, suffix)
}

/// Map script output onto [`JobCounts`]; prioritized jobs are still waiting
pub fn counts_from_reply(values: &[u64]) -> anyhow::Result<JobCounts> {
    let [wait, active, paused, completed, failed, delayed, stalled, prioritized] = values else {
        anyhow::bail!(
            "expected {} counters from queue script, got {}",
            COUNT_KEYS.len(),
            values.len()
        );
    };

    Ok(JobCounts {
        waiting: wait + prioritized,
        active: *active,
        completed: *completed,
        failed: *failed,
        delayed: *delayed,
        paused: *paused,
        stalled: *stalled,
    })
}

#[async_trait]
impl QueueProbe for RedisQueueMetrics {
    fn queue_names(&self) -> Vec<String> {
        self.queues.clone()
    }

    async fn job_counts(&self, queue: &str) -> anyhow::Result<JobCounts> {
        let conn = self.pool.get_connection(QUEUE_CONNECTION).await;
        let reply = conn.query(self.counts_command(queue)).await?;
        let values: Vec<u64> = redis::from_redis_value(&reply)?;
        counts_from_reply(&values)
    }
}
