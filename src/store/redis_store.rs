//! Redis-backed counter store.
//!
//! Counters map one-to-one onto Redis integer keys, so the service shares its
//! limits with every other instance pointed at the same database:
//!
//! - `increment` is `INCR`, which Redis executes atomically
//! - `set_expiration` is `EXPIRE`, so Redis itself ends each window
//! - `get` is `GET`, with a missing key read as 0
//!
//! Connections go through `redis::aio::ConnectionManager`, which reconnects
//! transparently. Individual command failures are surfaced as
//! [`StoreError::Backend`] and never retried here.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tracing::{debug, info};

use super::{CounterStore, StoreError, StoreResult};

/// Connection parameters for the Redis store.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Redis host name or address
    pub host: String,
    /// Redis port
    pub port: u16,
    /// Logical database index
    pub db: i64,
    /// How long to wait for the initial connection and `PING`
    pub connect_timeout: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            db: 0,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl RedisStoreConfig {
    /// Connection URL in the form `redis://host:port/db`.
    pub fn url(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.db)
    }
}

/// Counter store backed by a Redis server.
pub struct RedisStore {
    connection: RwLock<Option<ConnectionManager>>,
    config: RedisStoreConfig,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to Redis and verify the connection with `PING`.
    ///
    /// # Errors
    /// Returns an error if the server is unreachable or does not answer
    /// within `connect_timeout`.
    pub async fn connect(config: RedisStoreConfig) -> StoreResult<Self> {
        let client = Client::open(config.url())?;

        let connect = async {
            let mut connection = ConnectionManager::new(client).await?;
            let _: String = redis::cmd("PING").query_async(&mut connection).await?;
            Ok::<_, redis::RedisError>(connection)
        };

        let connection = tokio::time::timeout(config.connect_timeout, connect)
            .await
            .map_err(|_| StoreError::Timeout(config.connect_timeout))?
            .map_err(|e| StoreError::Backend(format!("failed to connect to Redis: {}", e)))?;

        info!(
            host = %config.host,
            port = config.port,
            db = config.db,
            "Connected to Redis"
        );

        Ok(Self {
            connection: RwLock::new(Some(connection)),
            config,
        })
    }

    /// The configuration this store was connected with.
    pub fn config(&self) -> &RedisStoreConfig {
        &self.config
    }

    /// Clone out a handle to the shared connection.
    fn connection(&self) -> StoreResult<ConnectionManager> {
        self.connection.read().clone().ok_or(StoreError::Closed)
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.connection()?;
        let count: u64 = conn.incr(key, 1u64).await?;
        Ok(count)
    }

    async fn get(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.connection()?;
        let count: Option<u64> = conn.get(key).await?;
        Ok(count.unwrap_or(0))
    }

    async fn set_expiration(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.connection()?;
        let seconds = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let _: bool = conn.expire(key, seconds).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.connection()?;
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.connection()?;
        let _: u64 = conn.del(key).await?;
        Ok(())
    }

    async fn close(&self) -> StoreResult<()> {
        if self.connection.write().take().is_some() {
            debug!(url = %self.config.url(), "Redis connection released");
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
