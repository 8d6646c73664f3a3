//! Counter store contract and backends.
//!
//! The admission engine only ever talks to a [`CounterStore`]. Any backend that
//! offers a linearizable increment plus key expiry can sit behind it:
//!
//! - [`MemoryStore`]: in-process map with TTL sweeping, for single instances and tests
//! - [`RedisStore`]: shared Redis server, for multi-instance deployments

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::{RedisStore, RedisStoreConfig};

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors that can occur in counter store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backend operation failed: {0}")]
    Backend(String),
    #[error("store connection is closed")]
    Closed,
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Minimal operation set the admission engine needs from a backing store.
///
/// `increment` must be linearizable across every caller sharing the store:
/// two concurrent increments on an absent key must never both return 1.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment the counter, creating it at 1 if absent.
    async fn increment(&self, key: &str) -> StoreResult<u64>;

    /// Current count, 0 if the key is absent.
    async fn get(&self, key: &str) -> StoreResult<u64>;

    /// Arm or replace the key's time-to-live.
    async fn set_expiration(&self, key: &str, ttl: Duration) -> StoreResult<()>;

    /// Whether the key currently holds a live counter.
    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Remove the key, ending its window early.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Release the underlying connection or resources.
    async fn close(&self) -> StoreResult<()>;

    /// Backend name for logging.
    fn backend_name(&self) -> &'static str;
}
