//! Relay from the queue library's event streams to the gateway
//!
//! Each queue publishes lifecycle events to `<prefix>:<queue>:events`. The
//! relay tails all of them with one blocking `XREAD` on a dedicated
//! connection and turns each entry into a [`JobEvent`]. Cursors start at
//! each stream's last entry and only ever advance to concrete ids, so entries
//! written between two reads are not skipped.

use redis::streams::{StreamRangeReply, StreamReadReply};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use glimmr_shared::JobEventKind;

use super::queue_metrics::queue_key;
use crate::config::QueueConfig;
use crate::pool::{Connection, ConnectionPoolManager, ConnectionStatus, EVENTS_CONNECTION};
use crate::websocket::{EventGateway, JobEvent};

const BLOCK_FOR: Duration = Duration::from_secs(5);
const READ_BATCH: usize = 100;
const RETRY_PAUSE: Duration = Duration::from_secs(1);
/// Cursor for a stream with no entries yet
const STREAM_START: &str = "0-0";

/// One stream entry
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub queue: String,
    pub id: String,
    pub fields: HashMap<String, String>,
}

pub struct QueueEventRelay {
    pool: Arc<ConnectionPoolManager>,
    gateway: Arc<EventGateway>,
    prefix: String,
    queues: Vec<String>,
    cancel: CancellationToken,
}

impl QueueEventRelay {
    pub fn new(
        pool: Arc<ConnectionPoolManager>,
        gateway: Arc<EventGateway>,
        config: &QueueConfig,
    ) -> Self {
        Self {
            pool,
            gateway,
            prefix: config.prefix.clone(),
            queues: config.names.clone(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(self) {
        if self.queues.is_empty() {
            info!("No job queues configured, queue event relay idle");
            return;
        }

        info!(queues = ?self.queues, "Queue event relay started");

        let mut cursors: Option<HashMap<String, String>> = None;

        loop {
            let conn = self.pool.get_connection(EVENTS_CONNECTION).await;
            if conn.status() != ConnectionStatus::Ready {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = conn.wait_until_ready(BLOCK_FOR) => continue,
                }
            }

            if cursors.is_none() {
                let resolved = tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    resolved = self.resolve_cursors(&conn) => resolved,
                };
                match resolved {
                    Ok(resolved) => {
                        debug!(cursors = ?resolved, "Queue event cursors resolved");
                        cursors = Some(resolved);
                    }
                    Err(e) => {
                        warn!(error = %e, "Resolving queue event stream positions failed");
                        tokio::select! {
                            _ = self.cancel.cancelled() => break,
                            _ = tokio::time::sleep(RETRY_PAUSE) => continue,
                        }
                    }
                }
            }
            let Some(positions) = cursors.as_mut() else {
                continue;
            };

            let cmd = self.read_command(positions);
            let timeout = BLOCK_FOR + conn.command_timeout();
            let reply = tokio::select! {
                _ = self.cancel.cancelled() => break,
                reply = conn.query_with_timeout(cmd, timeout) => reply,
            };

            let entries = match reply.map_err(anyhow::Error::from).and_then(|value| {
                parse_read_reply(&self.prefix, &value)
            }) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(error = %e, "Reading queue event streams failed");
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(RETRY_PAUSE) => continue,
                    }
                }
            };

            for entry in entries {
                positions.insert(entry.queue.clone(), entry.id.clone());
                self.forward(&entry).await;
            }
        }

        info!("Queue event relay stopped");
    }

    /// Last entry id of every stream, or the stream start when it is empty
    async fn resolve_cursors(
        &self,
        conn: &Connection,
    ) -> anyhow::Result<HashMap<String, String>> {
        let mut cursors = HashMap::with_capacity(self.queues.len());
        for queue in &self.queues {
            let mut cmd = redis::cmd("XREVRANGE");
            cmd.arg(queue_key(&self.prefix, queue, "events"))
                .arg("+")
                .arg("-")
                .arg("COUNT")
                .arg(1);
            let reply = conn.query(cmd).await?;
            cursors.insert(queue.clone(), last_entry_id(&reply)?);
        }
        Ok(cursors)
    }

    fn read_command(&self, cursors: &HashMap<String, String>) -> redis::Cmd {
        let mut cmd = redis::cmd("XREAD");
        cmd.arg("COUNT")
            .arg(READ_BATCH)
            .arg("BLOCK")
            .arg(BLOCK_FOR.as_millis() as u64)
            .arg("STREAMS");
        for queue in &self.queues {
            cmd.arg(queue_key(&self.prefix, queue, "events"));
        }
        for queue in &self.queues {
            cmd.arg(cursors.get(queue).map_or(STREAM_START, String::as_str));
        }
        cmd
    }

    /// Translate and broadcast one entry; returns recipients reached
    pub async fn forward(&self, entry: &StreamEntry) -> usize {
        match translate(&entry.queue, &entry.fields) {
            Some(event) => self.gateway.emit(event).await,
            None => {
                debug!(queue = %entry.queue, id = %entry.id, fields = ?entry.fields, "Ignoring queue event");
                0
            }
        }
    }
}

/// Decode an `XREAD` reply. `Nil` means the block timed out.
pub fn parse_read_reply(prefix: &str, value: &redis::Value) -> anyhow::Result<Vec<StreamEntry>> {
    if matches!(value, redis::Value::Nil) {
        return Ok(Vec::new());
    }

    let reply: StreamReadReply = redis::from_redis_value(value)?;
    let mut entries = Vec::new();
    for stream in reply.keys {
        let Some(queue) = queue_from_stream_key(prefix, &stream.key) else {
            warn!(key = %stream.key, "Unexpected stream key in XREAD reply");
            continue;
        };
        for id in stream.ids {
            let fields = id
                .map
                .iter()
                .filter_map(|(field, raw)| {
                    redis::from_redis_value::<String>(raw)
                        .ok()
                        .map(|text| (field.clone(), text))
                })
                .collect();
            entries.push(StreamEntry {
                queue: queue.clone(),
                id: id.id,
                fields,
            });
        }
    }
    Ok(entries)
}

/// Decode an `XREVRANGE ... COUNT 1` reply into a starting cursor
pub fn last_entry_id(value: &redis::Value) -> anyhow::Result<String> {
    if matches!(value, redis::Value::Nil) {
        return Ok(STREAM_START.to_string());
    }

    let reply: StreamRangeReply = redis::from_redis_value(value)?;
    Ok(reply
        .ids
        .into_iter()
        .next()
        .map_or_else(|| STREAM_START.to_string(), |entry| entry.id))
}

fn queue_from_stream_key(prefix: &str, key: &str) -> Option<String> {
    key.strip_prefix(prefix)?
        .strip_prefix(':')?
        .strip_suffix(":events")
        .filter(|queue| !queue.is_empty())
        .map(str::to_string)
}

/// Map a queue-library event onto a gateway event. Unknown events and
/// job events without a job id yield `None`.
pub fn translate(queue: &str, fields: &HashMap<String, String>) -> Option<JobEvent> {
    let event = fields.get("event")?.as_str();
    let job_id = fields.get("jobId").filter(|id| !id.is_empty());

    let job_event = |kind: JobEventKind| job_id.map(|id| JobEvent::for_job(queue, id.clone(), kind));

    match event {
        "added" => job_event(JobEventKind::Added).map(|e| {
            let job = json!({
                "id": job_id,
                "name": fields.get("name"),
            });
            e.with_field("job", job)
        }),
        "active" => job_event(JobEventKind::Started),
        "progress" => job_event(JobEventKind::Progress)
            .map(|e| e.with_field("progress", json_or_text(fields.get("data")))),
        "completed" => job_event(JobEventKind::Completed)
            .map(|e| e.with_field("result", json_or_text(fields.get("returnvalue")))),
        "failed" => job_event(JobEventKind::Failed).map(|e| {
            let reason = fields.get("failedReason").cloned().unwrap_or_default();
            e.with_field("error", json!(reason))
        }),
        "removed" => job_event(JobEventKind::Removed),
        "paused" | "resumed" | "drained" => {
            Some(JobEvent::new(queue, JobEventKind::StateChange).with_field("state", json!(event)))
        }
        "stalled" => job_event(JobEventKind::Alert).map(|e| {
            let message = format!("Job {} stalled in queue {}", e.job_id.as_deref().unwrap_or("?"), queue);
            e.with_field("severity", json!("warning"))
                .with_field("message", json!(message))
        }),
        _ => None,
    }
}

fn json_or_text(raw: Option<&String>) -> Value {
    match raw {
        Some(text) => serde_json::from_str(text).unwrap_or_else(|_| json!(text)),
        None => Value::Null,
    }
}
