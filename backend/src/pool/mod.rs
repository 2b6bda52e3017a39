//! Named connections to the shared backing store
//!
//! The manager owns every connection for the life of the process. Each
//! connection converges on its own (see [`connection`]); the manager adds a
//! periodic sweep that pings ready connections and revives closed or ended
//! ones, and a shutdown that drains everything.

pub mod connection;
pub mod link;
pub mod retry;

use futures::FutureExt;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use connection::{Connection, ConnectionSettings, ConnectionStatus};
pub use link::{ConnectionError, Connector, RedisConnector, StoreLink};

use crate::config::RedisConfig;

/// Shared client used by health checks
pub const DEFAULT_CONNECTION: &str = "default";
/// Queue metrics and other short commands
pub const QUEUE_CONNECTION: &str = "queue";
/// Dedicated to blocking stream reads
pub const EVENTS_CONNECTION: &str = "events";

/// Outcome of one pass of the health sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub pinged: usize,
    pub revived: usize,
    pub failed: usize,
}

enum SweepAction {
    Pinged,
    Revived,
    Skipped,
}

pub struct ConnectionPoolManager {
    connections: RwLock<HashMap<String, Connection>>,
    connector: Arc<dyn Connector>,
    settings: ConnectionSettings,
    sweep_interval: Duration,
    sweep: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl ConnectionPoolManager {
    pub fn new(connector: Arc<dyn Connector>, config: &RedisConfig) -> Self {
        Self::with_settings(
            connector,
            ConnectionSettings::from(config),
            config.health_sweep_interval,
        )
    }

    pub fn with_settings(
        connector: Arc<dyn Connector>,
        settings: ConnectionSettings,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            connector,
            settings,
            sweep_interval,
            sweep: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// Live connection for `name`, created on first use and replaced once
    /// the previous one has ended. Returns immediately; the handle connects
    /// in the background.
    pub async fn get_connection(&self, name: &str) -> Connection {
        {
            let connections = self.connections.read().await;
            if let Some(conn) = connections.get(name) {
                if conn.status() != ConnectionStatus::Ended {
                    return conn.clone();
                }
            }
        }

        let mut connections = self.connections.write().await;
        // Another caller may have replaced it while we waited for the lock
        match connections.get(name) {
            Some(conn) if conn.status() != ConnectionStatus::Ended => return conn.clone(),
            Some(_) => info!(connection = name, "Replacing ended backing store connection"),
            None => debug!(connection = name, "Creating backing store connection"),
        }

        let conn = self.create_connection(name).await;
        connections.insert(name.to_string(), conn.clone());
        conn
    }

    /// Build a connection with its own retry strategy. Not tracked; use
    /// [`get_connection`](Self::get_connection) for pooled access.
    pub async fn create_connection(&self, name: &str) -> Connection {
        Connection::open(name, self.connector.clone(), self.settings.clone()).await
    }

    pub async fn statuses(&self) -> BTreeMap<String, ConnectionStatus> {
        self.connections
            .read()
            .await
            .iter()
            .map(|(name, conn)| (name.clone(), conn.status()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Start the periodic sweep. Calling it twice is a no-op.
    pub async fn start_health_sweep(self: &Arc<Self>) {
        let mut sweep = self.sweep.lock().await;
        if sweep.is_some() {
            return;
        }

        let manager = Arc::clone(self);
        let cancel = self.cancel.clone();
        let period = self.sweep_interval;

        *sweep = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = manager.run_health_sweep().await;
                        debug!(
                            pinged = report.pinged,
                            revived = report.revived,
                            failed = report.failed,
                            "Connection health sweep finished"
                        );
                    }
                }
            }
        }));

        info!(interval_secs = period.as_secs(), "Connection health sweep started");
    }

    /// One sweep pass. A failure on one connection never stops the others.
    pub async fn run_health_sweep(&self) -> SweepReport {
        let snapshot: Vec<(String, Connection)> = self
            .connections
            .read()
            .await
            .iter()
            .map(|(name, conn)| (name.clone(), conn.clone()))
            .collect();

        let mut report = SweepReport::default();
        for (name, conn) in snapshot {
            let step = AssertUnwindSafe(Self::sweep_connection(&conn))
                .catch_unwind()
                .await;

            match step {
                Ok(Ok(SweepAction::Pinged)) => report.pinged += 1,
                Ok(Ok(SweepAction::Revived)) => report.revived += 1,
                Ok(Ok(SweepAction::Skipped)) => {}
                Ok(Err(e)) => {
                    report.failed += 1;
                    warn!(connection = %name, error = %e, "Health sweep probe failed");
                }
                Err(_) => {
                    report.failed += 1;
                    error!(connection = %name, "Health sweep step panicked");
                }
            }
        }
        report
    }

    async fn sweep_connection(conn: &Connection) -> Result<SweepAction, ConnectionError> {
        let status = conn.status();
        if status == ConnectionStatus::Ready {
            conn.ping().await?;
            Ok(SweepAction::Pinged)
        } else if status.needs_revival() {
            info!(connection = %conn.name(), %status, "Health sweep reconnecting");
            conn.reconnect().await;
            Ok(SweepAction::Revived)
        } else {
            Ok(SweepAction::Skipped)
        }
    }

    /// Stop the sweep and gracefully close every connection. Never fails;
    /// individual close errors are logged.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.sweep.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Health sweep task ended abnormally");
            }
        }

        let drained: Vec<(String, Connection)> =
            self.connections.write().await.drain().collect();
        let total = drained.len();

        for (name, conn) in drained {
            match AssertUnwindSafe(conn.close()).catch_unwind().await {
                Ok(Ok(())) => debug!(connection = %name, "Connection closed"),
                Ok(Err(e)) => warn!(connection = %name, error = %e, "Error closing connection"),
                Err(_) => error!(connection = %name, "Closing connection panicked"),
            }
        }

        info!(connections = total, "Connection pool shut down");
    }
}
