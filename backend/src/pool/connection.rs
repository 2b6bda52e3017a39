//! A single named backing-store connection and its lifecycle state machine

use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::link::{ConnectionError, Connector, StoreLink};
use super::retry::{RetryDecision, RetryTracker};
use crate::config::RedisConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Ready,
    Reconnecting,
    Closed,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connect,
    Ready,
    Error,
    Close,
    Reconnecting,
    End,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
            Self::Ended => "ended",
        }
    }

    /// Transition table. `None` marks an event that is invalid in this state.
    pub fn on(self, event: ConnectionEvent) -> Option<ConnectionStatus> {
        use ConnectionEvent as E;
        use ConnectionStatus as S;

        match (self, event) {
            (_, E::Connect) => Some(S::Connecting),
            (S::Connecting | S::Reconnecting, E::Ready) => Some(S::Ready),
            (S::Ended, E::Error) => None,
            (state, E::Error) => Some(state),
            (S::Connecting | S::Ready | S::Reconnecting, E::Close) => Some(S::Closed),
            (S::Connecting | S::Ready | S::Closed, E::Reconnecting) => Some(S::Reconnecting),
            (S::Ended, E::End) => None,
            (_, E::End) => Some(S::Ended),
            _ => None,
        }
    }

    /// States the health sweep tries to revive
    pub fn needs_revival(&self) -> bool {
        matches!(self, Self::Closed | Self::Ended)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ConnectionEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Ready => "ready",
            Self::Error => "error",
            Self::Close => "close",
            Self::Reconnecting => "reconnecting",
            Self::End => "end",
        }
    }
}

/// Per-connection timing and retry limits
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub max_retries: u32,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
}

impl From<&RedisConfig> for ConnectionSettings {
    fn from(config: &RedisConfig) -> Self {
        Self {
            max_retries: config.max_reconnect_attempts,
            connect_timeout: config.connect_timeout,
            command_timeout: config.command_timeout,
        }
    }
}

/// Cloneable handle to a named connection. Its state converges in a
/// background driver task; callers never wait on retries.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    status: watch::Sender<ConnectionStatus>,
    retry: Mutex<RetryTracker>,
    link: RwLock<Option<Arc<dyn StoreLink>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    connector: Arc<dyn Connector>,
    settings: ConnectionSettings,
}

impl Connection {
    /// Create the handle and start connecting in the background
    pub async fn open(
        name: &str,
        connector: Arc<dyn Connector>,
        settings: ConnectionSettings,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Connecting);
        let conn = Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                status,
                retry: Mutex::new(RetryTracker::new()),
                link: RwLock::new(None),
                driver: Mutex::new(None),
                connector,
                settings,
            }),
        };
        conn.reconnect().await;
        conn
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.borrow()
    }

    pub async fn retry_count(&self) -> u32 {
        self.inner.retry.lock().await.attempts()
    }

    /// Wait until the connection reaches `target`; `false` on timeout
    pub async fn wait_for_status(&self, target: ConnectionStatus, timeout: Duration) -> bool {
        let mut rx = self.inner.status.subscribe();
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(|status| *status == target)).await,
            Ok(Ok(_))
        )
    }

    pub async fn wait_until_ready(&self, timeout: Duration) -> bool {
        self.wait_for_status(ConnectionStatus::Ready, timeout).await
    }

    /// Start a fresh connect cycle unless one is already running.
    /// Returns whether a new driver was started.
    pub async fn reconnect(&self) -> bool {
        let mut driver = self.inner.driver.lock().await;
        if driver.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }

        if self.status() == ConnectionStatus::Ready {
            self.apply(ConnectionEvent::Reconnecting, None);
        }
        self.inner.link.write().await.take();

        let conn = self.clone();
        *driver = Some(tokio::spawn(async move { conn.drive().await }));
        true
    }

    pub async fn ping(&self) -> Result<String, ConnectionError> {
        let link = self.ready_link().await?;
        self.run(link.ping(), self.inner.settings.command_timeout).await
    }

    pub async fn query(&self, cmd: redis::Cmd) -> Result<redis::Value, ConnectionError> {
        self.query_with_timeout(cmd, self.inner.settings.command_timeout)
            .await
    }

    /// For blocking commands that legitimately outlive the command timeout
    pub async fn query_with_timeout(
        &self,
        cmd: redis::Cmd,
        timeout: Duration,
    ) -> Result<redis::Value, ConnectionError> {
        let link = self.ready_link().await?;
        self.run(link.query(cmd), timeout).await
    }

    pub fn command_timeout(&self) -> Duration {
        self.inner.settings.command_timeout
    }

    /// Stop any driver, QUIT the link and mark the connection ended
    pub async fn close(&self) -> Result<(), ConnectionError> {
        if let Some(handle) = self.inner.driver.lock().await.take() {
            handle.abort();
        }

        let link = self.inner.link.write().await.take();
        self.apply(ConnectionEvent::Close, None);

        let timeout = self.inner.settings.command_timeout;
        let result = match link {
            Some(link) => match tokio::time::timeout(timeout, link.quit()).await {
                Ok(result) => result,
                Err(_) => Err(ConnectionError::Timeout(timeout)),
            },
            None => Ok(()),
        };

        self.apply(ConnectionEvent::End, None);
        result
    }

    async fn drive(&self) {
        let name = self.name().to_string();
        let settings = self.inner.settings.clone();

        loop {
            self.apply(ConnectionEvent::Connect, None);

            let attempt = tokio::time::timeout(
                settings.connect_timeout,
                self.inner.connector.connect(&name),
            )
            .await;

            let err = match attempt {
                Ok(Ok(link)) => {
                    *self.inner.link.write().await = Some(link);
                    self.inner.retry.lock().await.record_success();
                    self.apply(ConnectionEvent::Ready, None);
                    return;
                }
                Ok(Err(e)) => e,
                Err(_) => ConnectionError::Timeout(settings.connect_timeout),
            };

            self.apply(ConnectionEvent::Error, Some(&err));

            let (decision, attempts) = {
                let mut retry = self.inner.retry.lock().await;
                (retry.record_failure(settings.max_retries), retry.attempts())
            };

            match decision {
                RetryDecision::RetryAfter(delay) => {
                    self.apply(ConnectionEvent::Reconnecting, None);
                    debug!(
                        connection = %name,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Scheduling reconnect"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp => {
                    error!(
                        connection = %name,
                        attempts,
                        max_retries = settings.max_retries,
                        "Backing store connection abandoned after max retries"
                    );
                    self.apply(ConnectionEvent::End, None);
                    return;
                }
                RetryDecision::Abandoned => {
                    self.apply(ConnectionEvent::End, None);
                    return;
                }
            }
        }
    }

    async fn ready_link(&self) -> Result<Arc<dyn StoreLink>, ConnectionError> {
        let not_ready = || ConnectionError::NotReady {
            name: self.name().to_string(),
            status: self.status(),
        };

        if self.status() != ConnectionStatus::Ready {
            return Err(not_ready());
        }
        self.inner.link.read().await.clone().ok_or_else(not_ready)
    }

    async fn run<T, F>(&self, command: F, timeout: Duration) -> Result<T, ConnectionError>
    where
        F: Future<Output = Result<T, ConnectionError>>,
    {
        let err = match tokio::time::timeout(timeout, command).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => e,
            Err(_) => ConnectionError::Timeout(timeout),
        };

        self.apply(ConnectionEvent::Error, Some(&err));
        if err.triggers_reconnect() {
            info!(connection = %self.name(), "Reconnecting after read-only reply");
            self.reconnect().await;
        } else if err.is_link_lost() {
            self.inner.link.write().await.take();
            self.apply(ConnectionEvent::Close, None);
        }
        Err(err)
    }

    fn apply(&self, event: ConnectionEvent, error: Option<&ConnectionError>) -> Option<ConnectionStatus> {
        let mut transition = None;
        self.inner.status.send_if_modified(|status| match status.on(event) {
            Some(next) => {
                transition = Some((*status, next));
                let changed = *status != next;
                *status = next;
                changed
            }
            None => false,
        });

        let name = self.name();
        match (transition, error) {
            (Some((from, to)), Some(err)) => {
                warn!(connection = %name, event = event.as_str(), %from, %to, error = %err, "Backing store connection error");
                Some(to)
            }
            (Some((from, to)), None) => {
                info!(connection = %name, event = event.as_str(), %from, %to, "Backing store connection {}", event.as_str());
                Some(to)
            }
            (None, _) => {
                debug!(connection = %name, event = event.as_str(), status = %self.status(), "Ignoring invalid connection transition");
                None
            }
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.inner.name)
            .field("status", &self.status())
            .finish()
    }
}
