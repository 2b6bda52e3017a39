use async_trait::async_trait;
use axum::http::{header::AUTHORIZATION, HeaderMap, HeaderValue};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tokio::sync::mpsc;

use glimmr_shared::{JobCounts, JobStatusCount, WsMessage};

use crate::health::{CacheProbe, DatastoreProbe, QueueProbe, StorageProbe};
use crate::pool::{ConnectionError, ConnectionSettings, ConnectionStatus, Connector, StoreLink};

pub const TEST_SECRET: &str = "test_secret_key_for_testing_only";

static TRACING: Once = Once::new();

/// Route `tracing` output through the test harness; `RUST_LOG` applies
pub fn init_test_logging() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

// ============================================
// Tokens
// ============================================

#[derive(Debug, Serialize, Deserialize)]
pub struct TestClaims {
    pub sub: String,
    pub roles: Vec<String>,
    pub exp: i64,
    pub iat: i64,
}

impl TestClaims {
    pub fn new(user_id: &str, roles: &[&str]) -> Self {
        let now = Utc::now();
        Self {
            sub: user_id.to_string(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            exp: (now + ChronoDuration::hours(1)).timestamp(),
            iat: now.timestamp(),
        }
    }
}

pub fn sign<T: Serialize>(claims: &T, secret: &str) -> String {
    encode(
        &Header::default(),
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("Failed to create test JWT")
}

pub fn create_test_jwt(user_id: &str, roles: &[&str]) -> String {
    sign(&TestClaims::new(user_id, roles), TEST_SECRET)
}

pub fn create_expired_jwt(user_id: &str, roles: &[&str]) -> String {
    let mut claims = TestClaims::new(user_id, roles);
    claims.exp = (Utc::now() - ChronoDuration::hours(1)).timestamp();
    sign(&claims, TEST_SECRET)
}

pub fn create_auth_headers(token: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", token)).expect("Failed to create auth header"),
    );
    headers
}

/// Everything currently buffered for a client
pub fn drain(rx: &mut mpsc::Receiver<WsMessage>) -> Vec<WsMessage> {
    let mut messages = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        messages.push(msg);
    }
    messages
}

pub fn event_names(messages: &[WsMessage]) -> Vec<&str> {
    messages.iter().map(|m| m.event_type.as_str()).collect()
}

// ============================================
// Backing store fakes
// ============================================

pub fn test_settings() -> ConnectionSettings {
    ConnectionSettings {
        max_retries: crate::pool::retry::MAX_RETRIES,
        connect_timeout: Duration::from_secs(1),
        command_timeout: Duration::from_secs(1),
    }
}

/// Link whose replies can be switched to failures mid-test. Queries are
/// answered from a script, then with `OK`, and every command is recorded.
pub struct FakeLink {
    reply: String,
    failure: Mutex<Option<ConnectionError>>,
    script: Mutex<VecDeque<redis::Value>>,
    commands: Mutex<Vec<Vec<String>>>,
    pub quit_calls: AtomicUsize,
}

impl FakeLink {
    pub fn new() -> Self {
        Self {
            reply: "PONG".to_string(),
            failure: Mutex::new(None),
            script: Mutex::new(VecDeque::new()),
            commands: Mutex::new(Vec::new()),
            quit_calls: AtomicUsize::new(0),
        }
    }

    pub fn script_replies(&self, replies: Vec<redis::Value>) {
        self.script.lock().unwrap().extend(replies);
    }

    /// Commands seen so far, each as its arguments
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.commands.lock().unwrap().clone()
    }

    pub fn fail_with(&self, err: Option<ConnectionError>) {
        *self.failure.lock().unwrap() = err;
    }

    fn check(&self) -> Result<(), ConnectionError> {
        match self.failure.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl StoreLink for FakeLink {
    async fn ping(&self) -> Result<String, ConnectionError> {
        self.check()?;
        Ok(self.reply.clone())
    }

    async fn query(&self, cmd: redis::Cmd) -> Result<redis::Value, ConnectionError> {
        self.check()?;
        let args = cmd
            .args_iter()
            .map(|arg| match arg {
                redis::Arg::Simple(bytes) => String::from_utf8_lossy(bytes).into_owned(),
                redis::Arg::Cursor => "<cursor>".to_string(),
            })
            .collect();
        self.commands.lock().unwrap().push(args);
        Ok(self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(redis::Value::Okay))
    }

    async fn quit(&self) -> Result<(), ConnectionError> {
        self.quit_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Fails a scripted number of connect attempts, then hands out one shared link
pub struct ScriptedConnector {
    failures_left: AtomicU32,
    attempts: AtomicU32,
    pub link: Arc<FakeLink>,
}

impl ScriptedConnector {
    pub fn failing_times(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures_left: AtomicU32::new(failures),
            attempts: AtomicU32::new(0),
            link: Arc::new(FakeLink::new()),
        })
    }

    pub fn healthy() -> Arc<Self> {
        Self::failing_times(0)
    }

    pub fn always_failing() -> Arc<Self> {
        Self::failing_times(u32::MAX)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Let every following attempt succeed
    pub fn recover(&self) {
        self.failures_left.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, _name: &str) -> Result<Arc<dyn StoreLink>, ConnectionError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                0 => None,
                u32::MAX => Some(u32::MAX),
                n => Some(n - 1),
            })
            .is_ok();

        if failed {
            Err(ConnectionError::Connect("connection refused".to_string()))
        } else {
            let link: Arc<dyn StoreLink> = self.link.clone();
            Ok(link)
        }
    }
}

// ============================================
// Health probe fakes
// ============================================

#[derive(Default, Clone)]
pub struct FakeDatastore {
    pub latency: Duration,
    pub error: Option<String>,
    pub panic: bool,
    pub status_counts: Vec<JobStatusCount>,
}

impl FakeDatastore {
    pub fn with_latency(ms: u64) -> Self {
        Self {
            latency: Duration::from_millis(ms),
            ..Default::default()
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            error: Some(message.to_string()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl DatastoreProbe for FakeDatastore {
    async fn round_trip(&self) -> anyhow::Result<()> {
        tokio::time::sleep(self.latency).await;
        if self.panic {
            panic!("datastore probe exploded");
        }
        match &self.error {
            Some(message) => anyhow::bail!("{}", message),
            None => Ok(()),
        }
    }

    async fn job_status_counts(&self, _since: DateTime<Utc>) -> anyhow::Result<Vec<JobStatusCount>> {
        match &self.error {
            Some(message) => anyhow::bail!("{}", message),
            None => Ok(self.status_counts.clone()),
        }
    }
}

#[derive(Clone)]
pub struct FakeCache {
    pub latency: Duration,
    pub reply: String,
    pub error: Option<String>,
    pub statuses: BTreeMap<String, ConnectionStatus>,
}

impl Default for FakeCache {
    fn default() -> Self {
        Self {
            latency: Duration::ZERO,
            reply: "PONG".to_string(),
            error: None,
            statuses: BTreeMap::from([("default".to_string(), ConnectionStatus::Ready)]),
        }
    }
}

impl FakeCache {
    pub fn with_latency(ms: u64) -> Self {
        Self {
            latency: Duration::from_millis(ms),
            ..Default::default()
        }
    }
}

#[async_trait]
impl CacheProbe for FakeCache {
    async fn ping(&self) -> anyhow::Result<String> {
        tokio::time::sleep(self.latency).await;
        match &self.error {
            Some(message) => anyhow::bail!("{}", message),
            None => Ok(self.reply.clone()),
        }
    }

    async fn connection_statuses(&self) -> BTreeMap<String, ConnectionStatus> {
        self.statuses.clone()
    }
}

#[derive(Default, Clone)]
pub struct FakeStorage {
    pub latency: Duration,
    pub error: Option<String>,
}

impl FakeStorage {
    pub fn with_latency(ms: u64) -> Self {
        Self {
            latency: Duration::from_millis(ms),
            error: None,
        }
    }
}

#[async_trait]
impl StorageProbe for FakeStorage {
    async fn list_probe_prefix(&self, _max_keys: usize) -> anyhow::Result<usize> {
        tokio::time::sleep(self.latency).await;
        match &self.error {
            Some(message) => anyhow::bail!("{}", message),
            None => Ok(0),
        }
    }
}

#[derive(Default, Clone)]
pub struct FakeQueues {
    pub counts: BTreeMap<String, JobCounts>,
    pub failing: HashSet<String>,
}

impl FakeQueues {
    pub fn with_counts(counts: &[(&str, JobCounts)]) -> Self {
        Self {
            counts: counts
                .iter()
                .map(|(queue, counts)| (queue.to_string(), *counts))
                .collect(),
            failing: HashSet::new(),
        }
    }
}

#[async_trait]
impl QueueProbe for FakeQueues {
    fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.counts.keys().cloned().collect();
        names.extend(self.failing.iter().cloned());
        names.sort();
        names
    }

    async fn job_counts(&self, queue: &str) -> anyhow::Result<JobCounts> {
        if self.failing.contains(queue) {
            anyhow::bail!("queue {} unavailable", queue);
        }
        Ok(self.counts.get(queue).copied().unwrap_or_default())
    }
}
