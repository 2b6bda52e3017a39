use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::ops::AddAssign;

// ============================================
// Health
// ============================================

/// Overall service health, as reported by `GET /health`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Worst-case roll-up: any `down` component makes the service unhealthy,
    /// otherwise any `degraded` component makes it degraded.
    pub fn from_components<'a, I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = &'a ComponentStatus>,
    {
        statuses
            .into_iter()
            .map(|status| match status {
                ComponentStatus::Up => HealthStatus::Healthy,
                ComponentStatus::Degraded => HealthStatus::Degraded,
                ComponentStatus::Down => HealthStatus::Unhealthy,
            })
            .max()
            .unwrap_or(HealthStatus::Healthy)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Up,
    Degraded,
    Down,
}

/// Result of probing a single dependency
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<JsonValue>,
}

impl ComponentHealth {
    pub fn up() -> Self {
        Self {
            status: ComponentStatus::Up,
            message: None,
            latency_ms: None,
            details: None,
        }
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self {
            status: ComponentStatus::Degraded,
            message: Some(message.into()),
            latency_ms: None,
            details: None,
        }
    }

    pub fn down(message: impl Into<String>) -> Self {
        Self {
            status: ComponentStatus::Down,
            message: Some(message.into()),
            latency_ms: None,
            details: None,
        }
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    pub fn with_details(mut self, details: JsonValue) -> Self {
        self.details = Some(details);
        self
    }

    pub fn is_down(&self) -> bool {
        self.status == ComponentStatus::Down
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub status: HealthStatus,
    pub checks: BTreeMap<String, ComponentHealth>,
    pub timestamp: DateTime<Utc>,
    /// Process uptime in seconds
    pub uptime: f64,
}

impl HealthCheckResult {
    pub fn new(checks: BTreeMap<String, ComponentHealth>, uptime: f64) -> Self {
        let status = HealthStatus::from_components(checks.values().map(|c| &c.status));
        Self {
            status,
            checks,
            timestamp: Utc::now(),
            uptime,
        }
    }
}

// ============================================
// Jobs
// ============================================

/// Job counts for one queue, by state
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
    pub paused: u64,
    pub stalled: u64,
}

impl JobCounts {
    pub fn total(&self) -> u64 {
        self.waiting + self.active + self.completed + self.failed + self.delayed + self.paused
    }
}

impl AddAssign for JobCounts {
    fn add_assign(&mut self, other: Self) {
        self.waiting += other.waiting;
        self.active += other.active;
        self.completed += other.completed;
        self.failed += other.failed;
        self.delayed += other.delayed;
        self.paused += other.paused;
        self.stalled += other.stalled;
    }
}

/// One row of the "jobs created in the last hour, by status" query
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobStatusCount {
    pub status: String,
    pub count: i64,
}

/// Lifecycle event kinds fanned out to real-time subscribers
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum JobEventKind {
    Started,
    Progress,
    Completed,
    Failed,
    Added,
    Removed,
    StateChange,
    Alert,
}

impl JobEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Progress => "progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Added => "added",
            Self::Removed => "removed",
            Self::StateChange => "stateChange",
            Self::Alert => "alert",
        }
    }

    /// Server event name the kind is delivered under
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Started | Self::Progress | Self::Completed | Self::Failed => "jobUpdate",
            Self::Added => "jobAdded",
            Self::Removed => "jobRemoved",
            Self::StateChange => "queueStateChange",
            Self::Alert => "alert",
        }
    }

    /// Job status reported alongside the event
    pub fn status(&self) -> &'static str {
        match self {
            Self::Started | Self::Progress => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Added => "waiting",
            Self::Removed => "removed",
            Self::StateChange => "changed",
            Self::Alert => "alert",
        }
    }
}

// ============================================
// WebSocket envelope
// ============================================

/// Message envelope used in both directions on `/ws`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WsMessage {
    pub event_type: String,
    #[serde(default)]
    pub payload: JsonValue,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl WsMessage {
    pub fn new(event_type: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}
