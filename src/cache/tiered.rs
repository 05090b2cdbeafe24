/// Tier selection and the memoization protocol
///
/// Tiers are ordered fastest-shared first. Every operation resolves against
/// the first tier that answers, and `get_or_compute` pins one tier for its
/// whole read/lock/write sequence so a value is never read from one tier and
/// written to another.

use super::{lock_key, CacheStore, MemoryStore, SqliteStore};
use crate::config::CacheConfig;
use crate::error::{CacheError, EngineError};
use serde_json::Value;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// How a memoized value was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// Served from the cache without computing
    Hit,
    /// Computed under the lock and written through
    Miss,
    /// Another holder computed it while we waited on the lock
    Waited,
    /// Computed without touching the cache (no tier, lock timeout, tier failure)
    Uncached,
}

/// Proof of holding a distributed lock on one tier.
///
/// Dropping the guard without calling [`LockGuard::release`] leaves the lock
/// to expire on its TTL.
pub struct LockGuard {
    tier: Arc<dyn CacheStore>,
    key: String,
    token: String,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the lock if this holder still owns it
    pub async fn release(self) -> bool {
        match self.tier.delete_if_equals(&self.key, &self.token).await {
            Ok(released) => {
                if !released {
                    tracing::debug!(lock = %self.key, "🔓 Lock expired before release");
                }
                released
            }
            Err(e) => {
                tracing::warn!(lock = %self.key, error = %e, "⚠️ Failed to release lock");
                false
            }
        }
    }
}

pub struct TieredCache {
    tiers: Vec<Arc<dyn CacheStore>>,
    config: CacheConfig,
}

impl TieredCache {
    pub fn new(tiers: Vec<Arc<dyn CacheStore>>, config: CacheConfig) -> Self {
        Self { tiers, config }
    }

    /// Process-local cache only
    pub fn in_memory(config: CacheConfig) -> Self {
        Self::new(vec![Arc::new(MemoryStore::new())], config)
    }

    /// Build the standard redis → sqlite → memory chain.
    ///
    /// Tiers that cannot be constructed are left out with a warning; the
    /// memory tier is always present.
    pub async fn from_config(config: CacheConfig, data_dir: &Path) -> Self {
        let mut tiers: Vec<Arc<dyn CacheStore>> = Vec::new();

        #[cfg(feature = "redis-store")]
        if let Some(url) = config.redis_url.as_deref() {
            match super::RedisStore::open(url) {
                Ok(store) => tiers.push(Arc::new(store)),
                Err(e) => tracing::warn!(error = %e, "⚠️ Redis tier disabled"),
            }
        }

        let db_path = data_dir.join("cache.db");
        match SqliteStore::connect(&db_path).await {
            Ok(store) => {
                match store.purge_expired().await {
                    Ok(0) => {}
                    Ok(purged) => tracing::info!("🧽 Purged {} expired cache entries", purged),
                    Err(e) => tracing::warn!(error = %e, "⚠️ Failed to purge expired cache entries"),
                }
                tiers.push(Arc::new(store));
            }
            Err(e) => tracing::warn!(path = %db_path.display(), error = %e, "⚠️ SQLite tier disabled"),
        }

        tiers.push(Arc::new(MemoryStore::new()));

        let names: Vec<&str> = tiers.iter().map(|t| t.name()).collect();
        tracing::info!("🗄️ Cache tiers: {}", names.join(" → "));

        Self::new(tiers, config)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// First tier that answers a ping
    pub async fn available_tier(&self) -> Option<Arc<dyn CacheStore>> {
        for tier in &self.tiers {
            match tier.ping().await {
                Ok(()) => return Some(Arc::clone(tier)),
                Err(e) => tracing::debug!(tier = tier.name(), error = %e, "cache tier unavailable"),
            }
        }
        None
    }

    /// Read a JSON value, falling through unavailable tiers
    pub async fn get(&self, key: &str) -> Option<Value> {
        for tier in &self.tiers {
            match read(tier.as_ref(), key).await {
                Ok(value) => return value,
                Err(e) => warn_fallthrough(tier.as_ref(), &e),
            }
        }
        None
    }

    /// Write a JSON value to the first tier that accepts it
    pub async fn set(&self, key: &str, value: &Value, ttl: Option<Duration>) -> bool {
        for tier in &self.tiers {
            match write(tier.as_ref(), key, value, ttl).await {
                Ok(()) => return true,
                Err(e) => warn_fallthrough(tier.as_ref(), &e),
            }
        }
        false
    }

    pub async fn delete(&self, key: &str) -> bool {
        for tier in &self.tiers {
            match tier.delete(key).await {
                Ok(()) => return true,
                Err(e) => warn_fallthrough(tier.as_ref(), &e),
            }
        }
        false
    }

    /// Try once to take the lock guarding `key` on the first available tier
    pub async fn try_lock(&self, key: &str) -> Option<LockGuard> {
        let tier = self.available_tier().await?;
        acquire(tier, key, self.config.lock_ttl()).await
    }

    /// Memoize `compute` under `key`.
    ///
    /// Hit → no call. Miss → take the lock, re-check, compute, write through
    /// on success, release. Lock held elsewhere → poll for the holder's value
    /// up to `lock_wait`, then compute uncached. Errors from `compute` are
    /// returned as-is and never cached.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        key: &str,
        ttl: Duration,
        compute: F,
    ) -> Result<(Value, CacheOutcome), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, E>>,
    {
        let Some(tier) = self.available_tier().await else {
            tracing::warn!(key = %key, "⚠️ No cache tier available, computing uncached");
            return compute().await.map(|v| (v, CacheOutcome::Uncached));
        };

        match read(tier.as_ref(), key).await {
            Ok(Some(value)) => {
                tracing::debug!(key = %key, tier = tier.name(), "🎯 Cache hit");
                return Ok((value, CacheOutcome::Hit));
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(key = %key, tier = tier.name(), error = %e, "⚠️ Cache read failed, computing uncached");
                return compute().await.map(|v| (v, CacheOutcome::Uncached));
            }
        }

        if let Some(guard) = acquire(Arc::clone(&tier), key, self.config.lock_ttl()).await {
            // Another holder may have written between our read and our lock
            if let Ok(Some(value)) = read(tier.as_ref(), key).await {
                guard.release().await;
                return Ok((value, CacheOutcome::Hit));
            }

            let result = compute().await;
            if let Ok(value) = &result {
                match write(tier.as_ref(), key, value, Some(ttl)).await {
                    Ok(()) => tracing::debug!(key = %key, tier = tier.name(), "💾 Cached node output"),
                    Err(e) => tracing::warn!(key = %key, error = %e, "⚠️ Cache write failed"),
                }
            }
            guard.release().await;
            return result.map(|v| (v, CacheOutcome::Miss));
        }

        match self.wait_for_value(tier.as_ref(), key).await {
            Some(value) => Ok((value, CacheOutcome::Waited)),
            None => {
                let timeout = EngineError::CacheLockTimeout { key: key.to_string() };
                tracing::warn!(error = %timeout, "⏱️ Recomputing without cache");
                compute().await.map(|v| (v, CacheOutcome::Uncached))
            }
        }
    }

    /// Poll for another holder's value. Gives up at the deadline, or early
    /// when the lock vanishes without a value being written.
    async fn wait_for_value(&self, tier: &dyn CacheStore, key: &str) -> Option<Value> {
        let deadline = Instant::now() + self.config.lock_wait();
        let lock = lock_key(key);

        loop {
            tokio::time::sleep(self.config.lock_poll()).await;

            if let Ok(Some(value)) = read(tier, key).await {
                return Some(value);
            }

            if matches!(tier.get(&lock).await, Ok(None)) {
                // Holder gone; its write may have landed just before release
                return read(tier, key).await.ok().flatten();
            }

            if Instant::now() >= deadline {
                return None;
            }
        }
    }
}

async fn acquire(tier: Arc<dyn CacheStore>, key: &str, ttl: Duration) -> Option<LockGuard> {
    let lock = lock_key(key);
    let token = Uuid::new_v4().to_string();

    match tier.set_if_absent(&lock, &token, ttl).await {
        Ok(true) => {
            tracing::debug!(lock = %lock, tier = tier.name(), "🔒 Lock acquired");
            Some(LockGuard { tier, key: lock, token })
        }
        Ok(false) => None,
        Err(e) => {
            tracing::warn!(lock = %lock, error = %e, "⚠️ Lock attempt failed");
            None
        }
    }
}

async fn read(tier: &dyn CacheStore, key: &str) -> Result<Option<Value>, CacheError> {
    match tier.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

async fn write(
    tier: &dyn CacheStore,
    key: &str,
    value: &Value,
    ttl: Option<Duration>,
) -> Result<(), CacheError> {
    let raw = serde_json::to_string(value)?;
    tier.set(key, &raw, ttl).await
}

fn warn_fallthrough(tier: &dyn CacheStore, error: &CacheError) {
    tracing::warn!(tier = tier.name(), error = %error, "⚠️ Cache tier failed, trying next");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheResult;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct DownStore;

    #[async_trait]
    impl CacheStore for DownStore {
        fn name(&self) -> &'static str {
            "down"
        }
        async fn ping(&self) -> CacheResult<()> {
            Err(CacheError::unavailable("down", "connection refused"))
        }
        async fn get(&self, _key: &str) -> CacheResult<Option<String>> {
            Err(CacheError::unavailable("down", "connection refused"))
        }
        async fn set(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> CacheResult<()> {
            Err(CacheError::unavailable("down", "connection refused"))
        }
        async fn delete(&self, _key: &str) -> CacheResult<()> {
            Err(CacheError::unavailable("down", "connection refused"))
        }
        async fn set_if_absent(&self, _key: &str, _value: &str, _ttl: Duration) -> CacheResult<bool> {
            Err(CacheError::unavailable("down", "connection refused"))
        }
        async fn delete_if_equals(&self, _key: &str, _expected: &str) -> CacheResult<bool> {
            Err(CacheError::unavailable("down", "connection refused"))
        }
    }

    fn fast_config() -> CacheConfig {
        CacheConfig {
            redis_url: None,
            default_ttl_secs: 60,
            lock_ttl_secs: 5,
            lock_wait_ms: 100,
            lock_poll_ms: 5,
        }
    }

    #[tokio::test]
    async fn falls_through_to_next_tier() {
        let memory = Arc::new(MemoryStore::new());
        let cache = TieredCache::new(vec![Arc::new(DownStore), memory.clone()], fast_config());

        assert!(cache.set("k", &json!({ "a": 1 }), None).await);
        assert_eq!(cache.get("k").await, Some(json!({ "a": 1 })));
        assert_eq!(memory.len(), 1);
    }

    #[tokio::test]
    async fn second_call_is_a_hit() {
        let cache = TieredCache::in_memory(fast_config());
        let calls = AtomicUsize::new(0);
        let ttl = Duration::from_secs(60);

        for expected in [CacheOutcome::Miss, CacheOutcome::Hit] {
            let (value, outcome) = cache
                .get_or_compute("k", ttl, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(json!("computed"))
                })
                .await
                .unwrap();
            assert_eq!(value, json!("computed"));
            assert_eq!(outcome, expected);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let cache = TieredCache::in_memory(fast_config());
        let ttl = Duration::from_secs(60);

        let err = cache
            .get_or_compute("k", ttl, || async { Err::<Value, _>("boom") })
            .await
            .unwrap_err();
        assert_eq!(err, "boom");
        assert_eq!(cache.get("k").await, None);
        // lock was released, so the next caller computes under the lock
        assert!(cache.try_lock("k").await.is_some());
    }

    #[tokio::test]
    async fn held_lock_times_out_into_uncached_compute() {
        let cache = TieredCache::in_memory(fast_config());
        let _held = cache.try_lock("k").await.unwrap();

        let (value, outcome) = cache
            .get_or_compute("k", Duration::from_secs(60), || async { Ok::<_, String>(json!(7)) })
            .await
            .unwrap();

        assert_eq!(value, json!(7));
        assert_eq!(outcome, CacheOutcome::Uncached);
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn no_tier_computes_uncached() {
        let cache = TieredCache::new(vec![Arc::new(DownStore)], fast_config());
        let (_, outcome) = cache
            .get_or_compute("k", Duration::from_secs(1), || async { Ok::<_, String>(json!(1)) })
            .await
            .unwrap();
        assert_eq!(outcome, CacheOutcome::Uncached);
    }
}
