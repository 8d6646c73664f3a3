//! Admission decision engine.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, trace};

use super::identity::{CounterKey, Identity, DEFAULT_NAMESPACE};
use super::policy::Policy;
use crate::config::FloodgateConfig;
use crate::error::Result;
use crate::store::{CounterStore, StoreError, StoreResult};

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request fits in the current window
    Allowed,
    /// The window's limit is already reached
    Denied,
}

impl Decision {
    /// Whether the request should proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

/// Fixed-window admission engine over a shared counter store.
///
/// The engine holds only configuration; every per-request state change goes
/// through the store, whose atomic increment is the sole point of
/// serialization between concurrent checks.
pub struct AdmissionEngine {
    /// Backing counter store
    store: Arc<dyn CounterStore>,
    /// Policy for requests identified by network address
    address_policy: Policy,
    /// Policy for tokens without an override
    token_policy: Policy,
    /// Per-token overrides, read on every token-bearing request
    token_overrides: RwLock<HashMap<String, Policy>>,
    /// Prefix for every counter key
    namespace: String,
    /// Bound on each individual store call
    store_timeout: Option<Duration>,
}

impl AdmissionEngine {
    /// Create an engine with the given default policies.
    pub fn new(store: Arc<dyn CounterStore>, address_policy: Policy, token_policy: Policy) -> Self {
        Self {
            store,
            address_policy,
            token_policy,
            token_overrides: RwLock::new(HashMap::new()),
            namespace: DEFAULT_NAMESPACE.to_string(),
            store_timeout: None,
        }
    }

    /// Build an engine from loaded configuration, registering every token
    /// override under its exact key.
    pub fn from_config(store: Arc<dyn CounterStore>, config: &FloodgateConfig) -> Result<Self> {
        let engine = Self::new(store, config.address_policy()?, config.token_policy()?)
            .with_namespace(config.key_namespace.clone())
            .with_store_timeout(config.store_timeout());
        for (token, policy) in &config.tokens {
            engine.configure_token(token.clone(), *policy);
        }
        Ok(engine)
    }

    /// Use a different key namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Fail any single store call that takes longer than `timeout`.
    ///
    /// Each call gets its own budget, so a stall surfaces as
    /// [`StoreError::Timeout`] from the call it happened in rather than
    /// cancelling the check between the first increment and arming expiry.
    pub fn with_store_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Register or replace the policy for one exact token.
    pub fn configure_token(&self, token: impl Into<String>, policy: Policy) {
        let token = token.into();
        debug!(
            token_len = token.len(),
            limit = policy.limit(),
            window_seconds = policy.window_seconds(),
            "Configured token policy"
        );
        self.token_overrides.write().insert(token, policy);
    }

    /// The override registered for `token`, if any.
    pub fn token_override(&self, token: &str) -> Option<Policy> {
        self.token_overrides.read().get(token).copied()
    }

    /// The policy that governs an identity.
    pub fn policy_for(&self, identity: &Identity) -> Policy {
        match identity {
            Identity::Address(_) => self.address_policy,
            Identity::Token(token) => self.token_override(token).unwrap_or(self.token_policy),
        }
    }

    /// The counter key for an identity.
    pub fn key_for(&self, identity: &Identity) -> CounterKey {
        CounterKey::new(&self.namespace, identity)
    }

    /// Decide whether a request from `address` carrying `token` is admitted.
    ///
    /// A non-empty token is evaluated on its own and the address is ignored.
    /// Store failures are returned as errors; no decision is implied by them.
    pub async fn decide(&self, address: &str, token: &str) -> Result<Decision> {
        let identity = Identity::resolve(address, token);
        let policy = self.policy_for(&identity);
        let key = self.key_for(&identity);

        self.check(&key, policy).await
    }

    /// Run one fixed-window check against the store.
    async fn check(&self, key: &CounterKey, policy: Policy) -> Result<Decision> {
        let current = self.bounded(self.store.get(key.as_str())).await?;

        trace!(
            key = %key,
            count = current,
            limit = policy.limit(),
            "Checking admission"
        );

        if current >= policy.limit() {
            debug!(key = %key, count = current, limit = policy.limit(), "Limit reached");
            return Ok(Decision::Denied);
        }

        let count = self.bounded(self.store.increment(key.as_str())).await?;

        // Only the request that opens the window arms its expiry.
        if count == 1 {
            self.bounded(self.store.set_expiration(key.as_str(), policy.window()))
                .await?;
            trace!(key = %key, window_seconds = policy.window_seconds(), "Window opened");
        }

        Ok(Decision::Allowed)
    }

    /// End the window for the identity chosen by the same precedence as
    /// [`decide`](Self::decide). Does nothing when both inputs are empty.
    pub async fn reset(&self, address: &str, token: &str) -> Result<()> {
        let Some(identity) = Identity::resolve_non_empty(address, token) else {
            return Ok(());
        };
        let key = self.key_for(&identity);
        self.bounded(self.store.delete(key.as_str())).await?;
        debug!(key = %key, "Counter reset");
        Ok(())
    }

    /// Current count for the identity, 0 if no window is open.
    pub async fn count(&self, address: &str, token: &str) -> Result<u64> {
        let key = self.key_for(&Identity::resolve(address, token));
        Ok(self.bounded(self.store.get(key.as_str())).await?)
    }

    /// Whether a window is currently open for the identity.
    pub async fn is_tracked(&self, address: &str, token: &str) -> Result<bool> {
        let key = self.key_for(&Identity::resolve(address, token));
        Ok(self.bounded(self.store.exists(key.as_str())).await?)
    }

    /// Release the underlying store.
    pub async fn shutdown(&self) -> Result<()> {
        debug!(backend = self.store.backend_name(), "Shutting down admission engine");
        self.store.close().await?;
        Ok(())
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    async fn bounded<T>(&self, call: impl Future<Output = StoreResult<T>>) -> StoreResult<T> {
        match self.store_timeout {
            Some(timeout) => tokio::time::timeout(timeout, call)
                .await
                .map_err(|_| StoreError::Timeout(timeout))?,
            None => call.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FloodgateError;
    use crate::store::{MemoryStore, StoreError, StoreResult};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Memory store that records every mutating call.
    #[derive(Default)]
    struct RecordingStore {
        inner: MemoryStore,
        calls: Mutex<Vec<String>>,
    }

    impl RecordingStore {
        fn calls(&self, op: &str) -> usize {
            self.calls
                .lock()
                .iter()
                .filter(|c| c.starts_with(op))
                .count()
        }

        fn record(&self, op: &str, key: &str) {
            self.calls.lock().push(format!("{op} {key}"));
        }
    }

    #[async_trait]
    impl CounterStore for RecordingStore {
        async fn increment(&self, key: &str) -> StoreResult<u64> {
            self.record("increment", key);
            self.inner.increment(key).await
        }

        async fn get(&self, key: &str) -> StoreResult<u64> {
            self.inner.get(key).await
        }

        async fn set_expiration(&self, key: &str, ttl: Duration) -> StoreResult<()> {
            self.record("expire", key);
            self.inner.set_expiration(key, ttl).await
        }

        async fn exists(&self, key: &str) -> StoreResult<bool> {
            self.inner.exists(key).await
        }

        async fn delete(&self, key: &str) -> StoreResult<()> {
            self.record("delete", key);
            self.inner.delete(key).await
        }

        async fn close(&self) -> StoreResult<()> {
            self.inner.close().await
        }

        fn backend_name(&self) -> &'static str {
            "recording"
        }
    }

    /// Memory store that takes `delay` to answer every call.
    struct SlowStore {
        inner: MemoryStore,
        delay: Duration,
    }

    impl SlowStore {
        fn new(delay: Duration) -> Self {
            Self {
                inner: MemoryStore::new(),
                delay,
            }
        }
    }

    #[async_trait]
    impl CounterStore for SlowStore {
        async fn increment(&self, key: &str) -> StoreResult<u64> {
            tokio::time::sleep(self.delay).await;
            self.inner.increment(key).await
        }

        async fn get(&self, key: &str) -> StoreResult<u64> {
            tokio::time::sleep(self.delay).await;
            self.inner.get(key).await
        }

        async fn set_expiration(&self, key: &str, ttl: Duration) -> StoreResult<()> {
            tokio::time::sleep(self.delay).await;
            self.inner.set_expiration(key, ttl).await
        }

        async fn exists(&self, key: &str) -> StoreResult<bool> {
            tokio::time::sleep(self.delay).await;
            self.inner.exists(key).await
        }

        async fn delete(&self, key: &str) -> StoreResult<()> {
            tokio::time::sleep(self.delay).await;
            self.inner.delete(key).await
        }

        async fn close(&self) -> StoreResult<()> {
            self.inner.close().await
        }

        fn backend_name(&self) -> &'static str {
            "slow"
        }
    }

    /// Log sink shared between a test and its subscriber.
    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Store whose every operation fails.
    struct FailingStore;

    #[async_trait]
    impl CounterStore for FailingStore {
        async fn increment(&self, _key: &str) -> StoreResult<u64> {
            Err(StoreError::Backend("connection refused".into()))
        }

        async fn get(&self, _key: &str) -> StoreResult<u64> {
            Err(StoreError::Backend("connection refused".into()))
        }

        async fn set_expiration(&self, _key: &str, _ttl: Duration) -> StoreResult<()> {
            Err(StoreError::Backend("connection refused".into()))
        }

        async fn exists(&self, _key: &str) -> StoreResult<bool> {
            Err(StoreError::Backend("connection refused".into()))
        }

        async fn delete(&self, _key: &str) -> StoreResult<()> {
            Err(StoreError::Backend("connection refused".into()))
        }

        async fn close(&self) -> StoreResult<()> {
            Ok(())
        }

        fn backend_name(&self) -> &'static str {
            "failing"
        }
    }

    fn policy(limit: u64, window_seconds: u64) -> Policy {
        Policy::new(limit, window_seconds).unwrap()
    }

    fn engine_with(store: Arc<dyn CounterStore>, ip: Policy, token: Policy) -> AdmissionEngine {
        AdmissionEngine::new(store, ip, token)
    }

    #[tokio::test]
    async fn test_address_limit_scenario() {
        let engine = engine_with(Arc::new(MemoryStore::new()), policy(5, 300), policy(10, 600));

        for i in 1..=5 {
            let decision = engine.decide("10.0.0.1", "").await.unwrap();
            assert_eq!(decision, Decision::Allowed, "Request {} should be allowed", i);
        }

        let decision = engine.decide("10.0.0.1", "").await.unwrap();
        assert_eq!(decision, Decision::Denied);
    }

    #[tokio::test]
    async fn test_token_override_scenario() {
        let engine = engine_with(Arc::new(MemoryStore::new()), policy(5, 300), policy(5, 300));
        engine.configure_token("tok1", policy(10, 600));

        for i in 1..=10 {
            let decision = engine.decide("10.0.0.1", "tok1").await.unwrap();
            assert!(decision.is_allowed(), "Request {} should be allowed", i);
        }

        let decision = engine.decide("10.0.0.1", "tok1").await.unwrap();
        assert_eq!(decision, Decision::Denied);
    }

    #[tokio::test]
    async fn test_reset_reopens_window() {
        let engine = engine_with(Arc::new(MemoryStore::new()), policy(2, 300), policy(10, 600));

        assert!(engine.decide("10.0.0.50", "").await.unwrap().is_allowed());
        assert!(engine.decide("10.0.0.50", "").await.unwrap().is_allowed());
        assert!(!engine.decide("10.0.0.50", "").await.unwrap().is_allowed());

        engine.reset("10.0.0.50", "").await.unwrap();

        assert!(engine.decide("10.0.0.50", "").await.unwrap().is_allowed());
        assert_eq!(engine.count("10.0.0.50", "").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_distinct_addresses_are_independent() {
        let engine = engine_with(Arc::new(MemoryStore::new()), policy(1, 300), policy(1, 300));

        assert!(engine.decide("10.0.0.1", "").await.unwrap().is_allowed());
        assert!(engine.decide("10.0.0.2", "").await.unwrap().is_allowed());
        assert!(!engine.decide("10.0.0.1", "").await.unwrap().is_allowed());
        assert!(!engine.decide("10.0.0.2", "").await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_token_ignores_address_state() {
        let store = Arc::new(RecordingStore::default());
        let engine = engine_with(store.clone(), policy(1, 300), policy(3, 300));

        // Exhaust the address first
        assert!(engine.decide("10.0.0.1", "").await.unwrap().is_allowed());
        assert!(!engine.decide("10.0.0.1", "").await.unwrap().is_allowed());

        // The token is evaluated on its own, from any address
        assert!(engine.decide("10.0.0.1", "tok").await.unwrap().is_allowed());
        assert!(engine.decide("10.0.0.9", "tok").await.unwrap().is_allowed());
        assert!(engine.decide("", "tok").await.unwrap().is_allowed());
        assert!(!engine.decide("10.0.0.1", "tok").await.unwrap().is_allowed());

        assert_eq!(engine.count("10.0.0.1", "").await.unwrap(), 1);
        assert_eq!(engine.count("10.0.0.9", "").await.unwrap(), 0);
        assert_eq!(store.calls("increment limiter:ip:"), 1);
    }

    #[tokio::test]
    async fn test_override_does_not_leak_to_other_tokens() {
        let engine = engine_with(Arc::new(MemoryStore::new()), policy(5, 300), policy(2, 300));
        engine.configure_token("A", policy(100, 300));

        assert!(engine.decide("", "B").await.unwrap().is_allowed());
        assert!(engine.decide("", "B").await.unwrap().is_allowed());
        assert!(!engine.decide("", "B").await.unwrap().is_allowed());

        assert_eq!(engine.policy_for(&Identity::Token("B".into())), policy(2, 300));
        assert_eq!(engine.policy_for(&Identity::Token("A".into())), policy(100, 300));
    }

    #[tokio::test]
    async fn test_configure_token_replaces_override() {
        let engine = engine_with(Arc::new(MemoryStore::new()), policy(5, 300), policy(5, 300));
        engine.configure_token("tok", policy(1, 60));
        engine.configure_token("tok", policy(3, 60));

        assert_eq!(engine.token_override("tok"), Some(policy(3, 60)));
        assert_eq!(engine.token_override("other"), None);
    }

    #[tokio::test]
    async fn test_expiry_armed_once_per_window() {
        let store = Arc::new(RecordingStore::default());
        let engine = engine_with(store.clone(), policy(3, 300), policy(3, 300));

        for _ in 0..5 {
            engine.decide("10.0.0.1", "").await.unwrap();
        }

        assert_eq!(store.calls("expire"), 1);
        assert_eq!(store.calls("increment"), 3);
        assert!(store
            .inner
            .ttl("limiter:ip:10.0.0.1")
            .is_some_and(|ttl| ttl <= Duration::from_secs(300)));
    }

    #[tokio::test]
    async fn test_denied_call_does_not_mutate_store() {
        let store = Arc::new(RecordingStore::default());
        let engine = engine_with(store.clone(), policy(1, 300), policy(1, 300));

        engine.decide("10.0.0.1", "").await.unwrap();
        let mutations = store.calls.lock().len();

        for _ in 0..3 {
            assert_eq!(engine.decide("10.0.0.1", "").await.unwrap(), Decision::Denied);
        }

        assert_eq!(store.calls.lock().len(), mutations);
        assert_eq!(engine.count("10.0.0.1", "").await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_expiry_rearms_full_window() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(store.clone(), policy(2, 60), policy(2, 60));
        let key = "limiter:ip:10.0.0.1";

        engine.decide("10.0.0.1", "").await.unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        engine.decide("10.0.0.1", "").await.unwrap();

        // The second admission does not extend the window
        assert_eq!(store.ttl(key), Some(Duration::from_secs(30)));
        assert!(!engine.decide("10.0.0.1", "").await.unwrap().is_allowed());

        // Long after expiry the next admission opens a fresh, full window
        tokio::time::advance(Duration::from_secs(500)).await;
        assert!(!engine.is_tracked("10.0.0.1", "").await.unwrap());
        assert!(engine.decide("10.0.0.1", "").await.unwrap().is_allowed());
        assert_eq!(engine.count("10.0.0.1", "").await.unwrap(), 1);
        assert_eq!(store.ttl(key), Some(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_reset_with_no_identity_is_noop() {
        let store = Arc::new(RecordingStore::default());
        let engine = engine_with(store.clone(), policy(1, 300), policy(1, 300));

        engine.reset("", "").await.unwrap();
        assert_eq!(store.calls("delete"), 0);
    }

    #[tokio::test]
    async fn test_reset_follows_token_precedence() {
        let engine = engine_with(Arc::new(MemoryStore::new()), policy(1, 300), policy(1, 300));

        engine.decide("10.0.0.1", "").await.unwrap();
        engine.decide("10.0.0.1", "tok").await.unwrap();

        engine.reset("10.0.0.1", "tok").await.unwrap();

        assert!(!engine.is_tracked("", "tok").await.unwrap());
        assert!(engine.is_tracked("10.0.0.1", "").await.unwrap());
    }

    #[tokio::test]
    async fn test_custom_namespace() {
        let store = Arc::new(MemoryStore::new());
        let engine =
            engine_with(store.clone(), policy(1, 300), policy(1, 300)).with_namespace("edge");

        engine.decide("10.0.0.1", "").await.unwrap();

        assert!(store.exists("edge:ip:10.0.0.1").await.unwrap());
        assert!(!store.exists("limiter:ip:10.0.0.1").await.unwrap());
    }

    #[tokio::test]
    async fn test_store_failure_propagates() {
        let engine = engine_with(Arc::new(FailingStore), policy(1, 300), policy(1, 300));

        let result = engine.decide("10.0.0.1", "").await;
        assert!(matches!(
            result,
            Err(FloodgateError::Store(StoreError::Backend(_)))
        ));

        assert!(engine.reset("10.0.0.1", "").await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_closes_store() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(store.clone(), policy(1, 300), policy(1, 300));

        engine.shutdown().await.unwrap();

        assert!(matches!(
            engine.decide("10.0.0.1", "").await,
            Err(FloodgateError::Store(StoreError::Closed))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_decisions_arm_expiry_once() {
        let store = Arc::new(RecordingStore::default());
        let engine = Arc::new(engine_with(store.clone(), policy(1000, 300), policy(1000, 300)));

        let mut handles = Vec::new();
        for _ in 0..100 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine.decide("10.0.0.1", "").await.unwrap()
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_allowed());
        }

        assert_eq!(store.calls("expire"), 1);
        assert_eq!(engine.count("10.0.0.1", "").await.unwrap(), 100);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_configure_token_during_traffic() {
        let engine = Arc::new(engine_with(
            Arc::new(MemoryStore::new()),
            policy(5, 300),
            policy(5, 300),
        ));

        let writer = {
            let engine = engine.clone();
            tokio::spawn(async move {
                for i in 0..50 {
                    engine.configure_token(format!("tok{i}"), policy(10, 60));
                }
            })
        };
        let reader = {
            let engine = engine.clone();
            tokio::spawn(async move {
                for i in 0..50 {
                    engine.decide("", &format!("tok{i}")).await.unwrap();
                }
            })
        };

        writer.await.unwrap();
        reader.await.unwrap();

        for i in 0..50 {
            assert_eq!(engine.token_override(&format!("tok{i}")), Some(policy(10, 60)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_timeout_applies_per_call() {
        // Three calls of 40ms each exceed 50ms in total but never individually
        let store = Arc::new(SlowStore::new(Duration::from_millis(40)));
        let engine = engine_with(store.clone(), policy(2, 60), policy(2, 60))
            .with_store_timeout(Some(Duration::from_millis(50)));

        assert!(engine.decide("10.0.0.1", "").await.unwrap().is_allowed());
        assert_eq!(store.inner.get("limiter:ip:10.0.0.1").await.unwrap(), 1);
        assert_eq!(store.inner.ttl("limiter:ip:10.0.0.1"), Some(Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_store_call_times_out() {
        let store = Arc::new(SlowStore::new(Duration::from_millis(200)));
        let engine = engine_with(store.clone(), policy(2, 60), policy(2, 60))
            .with_store_timeout(Some(Duration::from_millis(50)));

        let result = engine.decide("10.0.0.1", "").await;
        assert!(matches!(
            result,
            Err(FloodgateError::Store(StoreError::Timeout(_)))
        ));
        assert!(!store.inner.exists("limiter:ip:10.0.0.1").await.unwrap());
    }

    #[test]
    fn test_configure_token_does_not_log_token() {
        let logs = LogBuffer::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        let engine = engine_with(Arc::new(MemoryStore::new()), policy(5, 300), policy(5, 300));
        tracing::subscriber::with_default(subscriber, || {
            engine.configure_token("s3cr3t-bearer", policy(10, 60));
        });

        let output = String::from_utf8(logs.0.lock().clone()).unwrap();
        assert!(output.contains("Configured token policy"));
        assert!(!output.contains("s3cr3t-bearer"));
    }

    #[tokio::test]
    async fn test_from_config_keeps_token_case() {
        let yaml = r#"
rate_limit_token: 1
tokens:
  PremiumToken:
    limit: 3
    window_seconds: 60
"#;
        let env = ::config::Environment::default().source(Some(Default::default()));
        let config = FloodgateConfig::from_yaml(yaml, env).unwrap();
        let engine = AdmissionEngine::from_config(Arc::new(MemoryStore::new()), &config).unwrap();

        assert_eq!(engine.token_override("PremiumToken"), Some(policy(3, 60)));
        assert_eq!(engine.token_override("premiumtoken"), None);

        for _ in 0..3 {
            assert!(engine.decide("10.0.0.1", "PremiumToken").await.unwrap().is_allowed());
        }
        assert!(!engine.decide("10.0.0.1", "PremiumToken").await.unwrap().is_allowed());
    }
}
