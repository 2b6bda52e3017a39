// Background Jobs
//
// Queue statistics are published on a tokio-cron-scheduler timer; queue
// lifecycle events are relayed from the backing store as they happen.

pub mod queue_events;
pub mod queue_metrics;
pub mod scheduler;

pub use queue_events::{QueueEventRelay, StreamEntry};
pub use queue_metrics::RedisQueueMetrics;
pub use scheduler::{JobConfig, JobScheduler, QueueStatsPublisher};
