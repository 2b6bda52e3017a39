use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use std::sync::Arc;
use std::time::Duration;

use super::connection::ConnectionStatus;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectionError {
    #[error("Invalid backing store configuration: {0}")]
    InvalidConfig(String),
    #[error("Connection to backing store failed: {0}")]
    Connect(String),
    #[error("Backing store replica is read-only: {0}")]
    ReadOnly(String),
    #[error("Connection dropped: {0}")]
    Dropped(String),
    #[error("Command failed: {0}")]
    Command(String),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("Connection '{name}' is not ready ({status})")]
    NotReady { name: String, status: ConnectionStatus },
}

impl ConnectionError {
    /// Errors that warrant tearing the link down and reconnecting right away.
    /// A stale replica answering READONLY is the only such case; everything
    /// else is left to the retry strategy and the health sweep.
    pub fn triggers_reconnect(&self) -> bool {
        matches!(self, Self::ReadOnly(_))
    }

    /// The underlying link is gone and must not be reused
    pub fn is_link_lost(&self) -> bool {
        matches!(self, Self::Dropped(_))
    }
}

impl From<redis::RedisError> for ConnectionError {
    fn from(err: redis::RedisError) -> Self {
        if err.kind() == redis::ErrorKind::ReadOnly || err.code() == Some("READONLY") {
            Self::ReadOnly(err.to_string())
        } else if err.is_connection_dropped() || err.is_io_error() {
            Self::Dropped(err.to_string())
        } else if err.is_connection_refusal() {
            Self::Connect(err.to_string())
        } else {
            Self::Command(err.to_string())
        }
    }
}

/// An established link to the backing store
#[async_trait]
pub trait StoreLink: Send + Sync {
    async fn ping(&self) -> Result<String, ConnectionError>;

    async fn query(&self, cmd: redis::Cmd) -> Result<redis::Value, ConnectionError>;

    /// Graceful close
    async fn quit(&self) -> Result<(), ConnectionError>;
}

/// Opens links; one call per connect attempt
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, name: &str) -> Result<Arc<dyn StoreLink>, ConnectionError>;
}

pub struct RedisConnector {
    client: redis::Client,
}

impl RedisConnector {
    pub fn new(url: &str) -> Result<Self, ConnectionError> {
        let client =
            redis::Client::open(url).map_err(|e| ConnectionError::InvalidConfig(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Connector for RedisConnector {
    async fn connect(&self, name: &str) -> Result<Arc<dyn StoreLink>, ConnectionError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| match ConnectionError::from(e) {
                ConnectionError::Command(msg) | ConnectionError::Dropped(msg) => {
                    ConnectionError::Connect(msg)
                }
                other => other,
            })?;

        // Shows up in CLIENT LIST; purely informational
        let client_name = format!("glimmr:{}", name.replace(char::is_whitespace, "-"));
        let named: redis::RedisResult<()> = redis::cmd("CLIENT")
            .arg("SETNAME")
            .arg(&client_name)
            .query_async(&mut conn)
            .await;
        if let Err(e) = named {
            tracing::debug!(connection = name, error = %e, "CLIENT SETNAME rejected");
        }

        Ok(Arc::new(RedisLink { conn }))
    }
}

pub struct RedisLink {
    conn: MultiplexedConnection,
}

#[async_trait]
impl StoreLink for RedisLink {
    async fn ping(&self) -> Result<String, ConnectionError> {
        let mut conn = self.conn.clone();
        let reply: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(reply)
    }

    async fn query(&self, cmd: redis::Cmd) -> Result<redis::Value, ConnectionError> {
        let mut conn = self.conn.clone();
        let value: redis::Value = cmd.query_async(&mut conn).await?;
        Ok(value)
    }

    async fn quit(&self) -> Result<(), ConnectionError> {
        let mut conn = self.conn.clone();
        let _: redis::Value = redis::cmd("QUIT").query_async(&mut conn).await?;
        Ok(())
    }
}
