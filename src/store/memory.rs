//! In-process counter store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{CounterStore, StoreError, StoreResult};

/// A counter and its optional expiry deadline.
#[derive(Debug, Clone, Copy, Default)]
struct CounterEntry {
    count: u64,
    expires_at: Option<Instant>,
}

impl CounterEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

/// Counter store backed by a concurrent in-process map.
///
/// Increments hold the key's shard lock for the read-modify-write, which makes
/// them linearizable for every task in this process. Expired entries read as
/// absent immediately; [`MemoryStore::purge_expired`] reclaims their memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    counters: DashMap<String, CounterEntry>,
    closed: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remaining time-to-live for a key, if it is live and has one armed.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let entry = self.counters.get(key)?;
        if entry.is_expired(now) {
            return None;
        }
        entry.expires_at.map(|deadline| deadline - now)
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.counters.len();
        self.counters.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.counters.len())
    }

    /// Number of entries currently held, expired or not.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Spawn a background task that purges expired entries every `interval`.
    ///
    /// The task holds only a weak reference and exits once the store is
    /// dropped or closed.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else { break };
                if store.closed.load(Ordering::Acquire) {
                    break;
                }
                let purged = store.purge_expired();
                if purged > 0 {
                    debug!(purged, remaining = store.len(), "Purged expired counters");
                }
            }
            trace!("Memory store sweeper stopped");
        })
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(&self, key: &str) -> StoreResult<u64> {
        self.ensure_open()?;
        let now = Instant::now();
        let mut entry = self.counters.entry(key.to_string()).or_default();
        if entry.is_expired(now) {
            *entry = CounterEntry::default();
        }
        entry.count += 1;
        Ok(entry.count)
    }

    async fn get(&self, key: &str) -> StoreResult<u64> {
        self.ensure_open()?;
        let now = Instant::now();
        let count = match self.counters.get(key) {
            Some(entry) if !entry.is_expired(now) => entry.count,
            _ => 0,
        };
        Ok(count)
    }

    async fn set_expiration(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        self.ensure_open()?;
        let now = Instant::now();
        if let Some(mut entry) = self.counters.get_mut(key) {
            if !entry.is_expired(now) {
                entry.expires_at = Some(now + ttl);
            }
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.ensure_open()?;
        let now = Instant::now();
        Ok(self
            .counters
            .get(key)
            .is_some_and(|entry| !entry.is_expired(now)))
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.ensure_open()?;
        self.counters.remove(key);
        Ok(())
    }

    async fn close(&self) -> StoreResult<()> {
        self.closed.store(true, Ordering::Release);
        self.counters.clear();
        debug!("Memory store closed");
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
