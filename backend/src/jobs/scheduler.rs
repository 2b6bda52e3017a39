// Job Scheduler - periodic work that runs next to the gateway

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler as TokioScheduler, JobSchedulerError};
use tracing::{debug, info, warn};

use glimmr_shared::JobCounts;

use crate::config::QueueConfig;
use crate::health::QueueProbe;
use crate::websocket::EventGateway;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Scheduler error: {0}")]
    SchedulerError(#[from] JobSchedulerError),
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type JobResult<T> = Result<T, JobError>;

#[derive(Debug, Clone)]
pub struct JobConfig {
    pub stats_interval: Duration,
}

impl From<&QueueConfig> for JobConfig {
    fn from(config: &QueueConfig) -> Self {
        Self {
            stats_interval: Duration::from_secs(config.stats_interval_secs),
        }
    }
}

/// Outcome of one stats run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PublishReport {
    pub queues_published: usize,
    pub queues_failed: usize,
    pub totals: JobCounts,
}

/// Samples queue counts and pushes `queueStats` / `systemStats`
pub struct QueueStatsPublisher {
    queues: Arc<dyn QueueProbe>,
    gateway: Arc<EventGateway>,
}

impl QueueStatsPublisher {
    pub fn new(queues: Arc<dyn QueueProbe>, gateway: Arc<EventGateway>) -> Self {
        Self { queues, gateway }
    }

    pub async fn publish(&self) -> PublishReport {
        let mut report = PublishReport::default();

        for queue in self.queues.queue_names() {
            match self.queues.job_counts(&queue).await {
                Ok(counts) => {
                    self.gateway.queue_stats(&queue, &counts).await;
                    report.totals += counts;
                    report.queues_published += 1;
                }
                Err(e) => {
                    report.queues_failed += 1;
                    warn!(queue = %queue, error = %e, "Failed to sample queue counts");
                }
            }
        }

        self.gateway
            .system_stats(&report.totals, report.queues_published)
            .await;
        report
    }
}

pub struct JobScheduler {
    scheduler: TokioScheduler,
    publisher: Arc<QueueStatsPublisher>,
    config: JobConfig,
}

impl JobScheduler {
    pub async fn new(publisher: QueueStatsPublisher, config: JobConfig) -> JobResult<Self> {
        if config.stats_interval.is_zero() {
            return Err(JobError::ConfigError(
                "stats interval must be greater than zero".to_string(),
            ));
        }

        let scheduler = TokioScheduler::new().await?;

        Ok(Self {
            scheduler,
            publisher: Arc::new(publisher),
            config,
        })
    }

    pub async fn start(&self) -> JobResult<()> {
        info!("Starting background job scheduler");

        self.schedule_queue_stats().await?;
        self.scheduler.start().await?;

        info!("Background job scheduler started successfully");
        Ok(())
    }

    pub async fn shutdown(&mut self) -> JobResult<()> {
        info!("Shutting down background job scheduler");
        self.scheduler.shutdown().await?;
        Ok(())
    }

    async fn schedule_queue_stats(&self) -> JobResult<()> {
        let interval = self.config.stats_interval;
        let publisher = self.publisher.clone();

        let job = Job::new_repeated_async(interval, move |_uuid, _lock| {
            let publisher = publisher.clone();

            Box::pin(async move {
                let report = publisher.publish().await;
                debug!(
                    published = report.queues_published,
                    failed = report.queues_failed,
                    "Queue stats published"
                );
            })
        })?;

        self.scheduler.add(job).await?;
        info!("Scheduled queue stats every {} seconds", interval.as_secs());

        Ok(())
    }
}
