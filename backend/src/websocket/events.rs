//! Rooms, job events and client requests carried over `/ws`

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::fmt;

use glimmr_shared::{JobEventKind, WsMessage};

use crate::auth::RoomKind;
use crate::error::{ApiResult, AppError};

pub const ALL_JOBS_ROOM: &str = "all-jobs";
const QUEUE_ROOM_PREFIX: &str = "queue:";
const JOB_ROOM_PREFIX: &str = "job:";

/// Server event names
pub mod server_events {
    pub const CONNECTED: &str = "connected";
    pub const SUBSCRIBED: &str = "subscribed";
    pub const UNSUBSCRIBED: &str = "unsubscribed";
    pub const QUEUE_STATS: &str = "queueStats";
    pub const SYSTEM_STATS: &str = "systemStats";
    pub const ERROR: &str = "error";
    pub const PONG: &str = "pong";
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Room {
    Queue(String),
    Job(String),
    AllJobs,
}

impl Room {
    pub fn name(&self) -> String {
        match self {
            Self::Queue(queue) => format!("{}{}", QUEUE_ROOM_PREFIX, queue),
            Self::Job(job_id) => format!("{}{}", JOB_ROOM_PREFIX, job_id),
            Self::AllJobs => ALL_JOBS_ROOM.to_string(),
        }
    }

    pub fn kind(&self) -> RoomKind {
        match self {
            Self::Queue(_) => RoomKind::Queue,
            Self::Job(_) => RoomKind::Job,
            Self::AllJobs => RoomKind::AllJobs,
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        if name == ALL_JOBS_ROOM {
            return Some(Self::AllJobs);
        }
        if let Some(queue) = name.strip_prefix(QUEUE_ROOM_PREFIX) {
            return (!queue.is_empty()).then(|| Self::Queue(queue.to_string()));
        }
        if let Some(job_id) = name.strip_prefix(JOB_ROOM_PREFIX) {
            return (!job_id.is_empty()).then(|| Self::Job(job_id.to_string()));
        }
        None
    }
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// A job lifecycle event on its way to subscribers
#[derive(Debug, Clone, PartialEq)]
pub struct JobEvent {
    pub queue: String,
    pub job_id: Option<String>,
    pub kind: JobEventKind,
    /// Extra fields merged into the outgoing payload
    pub payload: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl JobEvent {
    pub fn new(queue: impl Into<String>, kind: JobEventKind) -> Self {
        Self {
            queue: queue.into(),
            job_id: None,
            kind,
            payload: Map::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn for_job(queue: impl Into<String>, job_id: impl Into<String>, kind: JobEventKind) -> Self {
        let mut event = Self::new(queue, kind);
        event.job_id = Some(job_id.into());
        event
    }

    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.payload.insert(key.to_string(), value);
        self
    }

    /// Queue room, job room when the event names a job, and always `all-jobs`
    pub fn target_rooms(&self) -> Vec<Room> {
        let mut rooms = vec![Room::Queue(self.queue.clone())];
        if let Some(job_id) = &self.job_id {
            rooms.push(Room::Job(job_id.clone()));
        }
        rooms.push(Room::AllJobs);
        rooms
    }

    pub fn to_message(&self) -> WsMessage {
        let mut payload = self.payload.clone();
        payload.insert("queue".to_string(), json!(self.queue));
        if let Some(job_id) = &self.job_id {
            payload.insert("jobId".to_string(), json!(job_id));
        }
        payload.insert("type".to_string(), json!(self.kind.as_str()));
        payload.insert("status".to_string(), json!(self.kind.status()));
        payload.insert("timestamp".to_string(), json!(self.timestamp.to_rfc3339()));

        WsMessage {
            event_type: self.kind.event_name().to_string(),
            payload: Value::Object(payload),
            timestamp: self.timestamp,
        }
    }
}

/// Requests a client may send after connecting
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    SubscribeQueue(String),
    UnsubscribeQueue(String),
    SubscribeAll,
    UnsubscribeAll,
    SubscribeJob(String),
    UnsubscribeJob(String),
    Ping,
}

impl ClientRequest {
    pub fn parse(msg: &WsMessage) -> ApiResult<Self> {
        match msg.event_type.as_str() {
            "subscribeQueue" => Ok(Self::SubscribeQueue(argument(&msg.payload, "queue")?)),
            "unsubscribeQueue" => Ok(Self::UnsubscribeQueue(argument(&msg.payload, "queue")?)),
            "subscribeAll" => Ok(Self::SubscribeAll),
            "unsubscribeAll" => Ok(Self::UnsubscribeAll),
            "subscribeJob" => Ok(Self::SubscribeJob(argument(&msg.payload, "jobId")?)),
            "unsubscribeJob" => Ok(Self::UnsubscribeJob(argument(&msg.payload, "jobId")?)),
            "ping" => Ok(Self::Ping),
            other => Err(AppError::BadRequest(format!("Unknown event: {}", other))),
        }
    }

    pub fn room(&self) -> Option<Room> {
        match self {
            Self::SubscribeQueue(queue) | Self::UnsubscribeQueue(queue) => {
                Some(Room::Queue(queue.clone()))
            }
            Self::SubscribeJob(job_id) | Self::UnsubscribeJob(job_id) => {
                Some(Room::Job(job_id.clone()))
            }
            Self::SubscribeAll | Self::UnsubscribeAll => Some(Room::AllJobs),
            Self::Ping => None,
        }
    }
}

/// Accepts `{"<key>": "..."}`, a bare string, or a number (job ids)
fn argument(payload: &Value, key: &str) -> ApiResult<String> {
    let value = match payload {
        Value::Object(fields) => fields.get(key),
        other => Some(other),
    };

    let text = match value {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    };

    if text.is_empty() {
        return Err(AppError::BadRequest(format!("Missing '{}'", key)));
    }
    Ok(text)
}
