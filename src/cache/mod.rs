/// Multi-tier cache and distributed lock substrate.
///
/// Three interchangeable tiers implement [`CacheStore`]: a shared external
/// store (redis), an embedded local store (SQLite) and an in-process map.
/// [`TieredCache`] picks the first available tier per operation and layers
/// the memoization protocol (read, lock, compute, write-through) on top.

mod key;
mod memory;
#[cfg(feature = "redis-store")]
mod redis;
mod sqlite;
mod tiered;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::CacheError;

pub use key::{cache_key, heartbeat_key, lock_key};
pub use memory::MemoryStore;
#[cfg(feature = "redis-store")]
pub use self::redis::RedisStore;
pub use sqlite::SqliteStore;
pub use tiered::{CacheOutcome, LockGuard, TieredCache};

/// Result alias for tier operations
pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Contract shared by every cache tier.
///
/// Values are opaque strings (JSON-encoded by [`TieredCache`]). A tier that
/// cannot serve a request returns [`CacheError::Unavailable`].
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Short tier name for logs
    fn name(&self) -> &'static str;

    /// Cheap availability check
    async fn ping(&self) -> CacheResult<()>;

    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()>;

    async fn delete(&self, key: &str) -> CacheResult<()>;

    /// Write only if no live value exists; returns whether the write happened.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<bool>;

    /// Delete only if the stored value equals `expected`; returns whether it did.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> CacheResult<bool>;
}
