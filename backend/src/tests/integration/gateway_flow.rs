// Integration tests for queue events and stats flowing through the gateway

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use glimmr_shared::JobCounts;
use redis::Value;

use crate::config::QueueConfig;
use crate::jobs::{QueueEventRelay, QueueStatsPublisher, StreamEntry};
use crate::pool::ConnectionPoolManager;
use crate::tests::fixtures::{job_counts, JobFixture, UserFixture, QUEUES};
use crate::tests::helpers::{drain, event_names, test_settings, FakeQueues, ScriptedConnector};
use crate::tests::TestContext;
use crate::websocket::Room;

fn queue_config(names: &[&str]) -> QueueConfig {
    QueueConfig {
        prefix: "bull".to_string(),
        names: names.iter().map(|n| n.to_string()).collect(),
        stats_interval_secs: 5,
    }
}

fn relay_over(
    ctx: &TestContext,
    connector: Arc<ScriptedConnector>,
    names: &[&str],
) -> QueueEventRelay {
    let pool = Arc::new(ConnectionPoolManager::with_settings(
        connector,
        test_settings(),
        Duration::from_secs(30),
    ));
    QueueEventRelay::new(pool, ctx.gateway(), &queue_config(names))
}

fn relay(ctx: &TestContext, names: &[&str]) -> QueueEventRelay {
    relay_over(ctx, ScriptedConnector::healthy(), names)
}

fn data(text: &str) -> Value {
    Value::Data(text.as_bytes().to_vec())
}

/// One stream entry as `XRANGE`/`XREAD` encode it
fn stream_entry(id: &str, fields: &[(&str, &str)]) -> Value {
    let flat = fields
        .iter()
        .flat_map(|(k, v)| [data(k), data(v)])
        .collect();
    Value::Bulk(vec![data(id), Value::Bulk(flat)])
}

#[cfg(test)]
mod queue_event_integration_tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_entry_reaches_job_and_queue_subscribers() {
        let ctx = TestContext::new();
        let gateway = ctx.gateway();
        let job = JobFixture::default();

        let (queue_watcher, mut queue_rx) = gateway
            .connect(Some(&UserFixture::api_user().token()))
            .await
            .unwrap();
        let (job_watcher, mut job_rx) = gateway
            .connect(Some(&UserFixture::with_roles(&["viewer"]).token()))
            .await
            .unwrap();
        gateway
            .subscribe(queue_watcher, &Room::Queue(job.queue.clone()))
            .await
            .unwrap();
        gateway
            .subscribe(job_watcher, &Room::Job(job.id.clone()))
            .await
            .unwrap();
        drain(&mut queue_rx);
        drain(&mut job_rx);

        let relay = relay(&ctx, &QUEUES);
        let mut fields = job.stream_fields("completed");
        fields.insert("returnvalue".to_string(), r#"{"rows":512}"#.to_string());
        let entry = StreamEntry {
            queue: job.queue.clone(),
            id: "1700000000000-0".to_string(),
            fields,
        };

        assert_eq!(relay.forward(&entry).await, 2);

        for rx in [&mut queue_rx, &mut job_rx] {
            let received = drain(rx);
            assert_eq!(event_names(&received), vec!["jobUpdate"]);
            assert_eq!(received[0].payload["status"], "completed");
            assert_eq!(received[0].payload["result"]["rows"], 512);
        }
    }

    #[tokio::test]
    async fn test_added_event_carries_job() {
        let ctx = TestContext::new();
        let gateway = ctx.gateway();
        let job = JobFixture::default();

        let (admin, mut rx) = gateway
            .connect(Some(&UserFixture::admin().token()))
            .await
            .unwrap();
        gateway.subscribe(admin, &Room::AllJobs).await.unwrap();
        drain(&mut rx);

        let entry = StreamEntry {
            queue: job.queue.clone(),
            id: "1-0".to_string(),
            fields: job.stream_fields("added"),
        };
        assert_eq!(relay(&ctx, &QUEUES).forward(&entry).await, 1);

        let received = drain(&mut rx);
        assert_eq!(event_names(&received), vec!["jobAdded"]);
        assert_eq!(received[0].payload["job"]["id"], job.id.as_str());
        assert_eq!(received[0].payload["job"]["name"], job.name.as_str());
    }

    #[tokio::test]
    async fn test_unknown_stream_event_is_ignored() {
        let ctx = TestContext::new();
        let job = JobFixture::default();
        let entry = StreamEntry {
            queue: job.queue.clone(),
            id: "1-0".to_string(),
            fields: job.stream_fields("retries-exhausted"),
        };

        assert_eq!(relay(&ctx, &QUEUES).forward(&entry).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_stops_when_cancelled() {
        let ctx = TestContext::new();
        let relay = relay(&ctx, &QUEUES);
        let cancel = relay.cancellation_token();
        let handle = relay.spawn();

        tokio::time::sleep(Duration::from_secs(3)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("relay did not stop")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_cursors_never_fall_back_to_latest() {
        let ctx = TestContext::new();
        let gateway = ctx.gateway();
        let (admin, mut rx) = gateway
            .connect(Some(&UserFixture::admin().token()))
            .await
            .unwrap();
        gateway.subscribe(admin, &Room::AllJobs).await.unwrap();
        drain(&mut rx);

        let connector = ScriptedConnector::healthy();
        connector.link.script_replies(vec![
            // "exports" has never seen an event, "imports" has history
            Value::Bulk(vec![]),
            Value::Bulk(vec![stream_entry("3-0", &[("event", "drained")])]),
            Value::Bulk(vec![Value::Bulk(vec![
                data("bull:exports:events"),
                Value::Bulk(vec![stream_entry("5-0", &[("event", "active"), ("jobId", "77")])]),
            ])]),
            Value::Nil,
        ]);

        let relay = relay_over(&ctx, connector.clone(), &["exports", "imports"]);
        let cancel = relay.cancellation_token();
        let handle = relay.spawn();

        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("relay did not stop")
            .unwrap();

        let commands = connector.link.commands();
        assert_eq!(commands[0], ["XREVRANGE", "bull:exports:events", "+", "-", "COUNT", "1"]);
        assert_eq!(commands[1][1], "bull:imports:events");

        let reads: Vec<&Vec<String>> = commands.iter().filter(|c| c[0] == "XREAD").collect();
        assert!(reads.len() >= 3, "only {} reads", reads.len());
        assert_eq!(reads[0][reads[0].len() - 2..], ["0-0", "3-0"]);
        for read in &reads[1..] {
            assert_eq!(read[read.len() - 2..], ["5-0", "3-0"]);
        }
        assert!(commands.iter().flatten().all(|arg| arg != "$"));

        let received = drain(&mut rx);
        assert_eq!(event_names(&received), vec!["jobUpdate"]);
        assert_eq!(received[0].payload["jobId"], "77");
    }

    #[tokio::test]
    async fn test_relay_without_queues_exits() {
        let ctx = TestContext::new();
        let handle = relay(&ctx, &[]).spawn();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("idle relay did not exit")
            .unwrap();
    }
}

#[cfg(test)]
mod queue_stats_integration_tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_skips_unreachable_queue() {
        let ctx = TestContext::new();
        let gateway = ctx.gateway();

        let (admin, mut admin_rx) = gateway
            .connect(Some(&UserFixture::admin().token()))
            .await
            .unwrap();
        gateway.subscribe(admin, &Room::AllJobs).await.unwrap();
        drain(&mut admin_rx);

        let parser = job_counts(2, 4);
        let normalizer = job_counts(0, 1);
        let mut queues = FakeQueues::with_counts(&[
            ("price-file-parser", parser),
            ("price-normalizer", normalizer),
        ]);
        queues.failing = HashSet::from(["data-export".to_string()]);

        let publisher = QueueStatsPublisher::new(Arc::new(queues), gateway.clone());
        let report = publisher.publish().await;

        assert_eq!(report.queues_published, 2);
        assert_eq!(report.queues_failed, 1);
        assert_eq!(report.totals.failed, 5);
        assert_eq!(report.totals.stalled, 2);

        let received = drain(&mut admin_rx);
        assert_eq!(
            event_names(&received),
            vec!["queueStats", "queueStats", "systemStats"]
        );
        assert_eq!(received[2].payload["queues"], 2);
        assert_eq!(received[2].payload["totals"]["failed"], 5);
    }

    #[tokio::test]
    async fn test_publish_with_no_subscribers() {
        let ctx = TestContext::new();
        let queues = FakeQueues::with_counts(&[("data-export", JobCounts::default())]);
        let publisher = QueueStatsPublisher::new(Arc::new(queues), ctx.gateway());

        let report = publisher.publish().await;
        assert_eq!(report.queues_published, 1);
        assert_eq!(report.queues_failed, 0);
    }
}
