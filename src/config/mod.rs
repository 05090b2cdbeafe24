/// Configuration management for the Flowloom engine
///
/// Handles server binding, on-disk data location, cache tiers and the
/// scheduler/recovery timings. Every field can be overridden from the
/// environment for container deployments.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// On-disk storage configuration
    pub database: DatabaseConfig,
    /// Cache tiers and distributed lock tuning
    pub cache: CacheConfig,
    /// Scheduler, heartbeat and trigger tuning
    pub engine: EngineConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Base directory for the embedded cache tier and deployment records
    /// Creates: {data_dir}/cache.db, {data_dir}/deployments.db
    pub data_dir: String,
}

/// Cache configuration shared by all three tiers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Shared external store; the tier is skipped when unset
    pub redis_url: Option<String>,
    /// TTL applied to memoized node outputs
    pub default_ttl_secs: u64,
    /// TTL of a distributed lock record
    pub lock_ttl_secs: u64,
    /// How long a contender waits for the lock holder's value
    pub lock_wait_ms: u64,
    /// Poll interval while waiting for the holder's value
    pub lock_poll_ms: u64,
}

/// Scheduler, recovery and trigger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on node callables in flight per engine
    pub max_concurrency: usize,
    /// How often a live run writes its heartbeat
    pub heartbeat_interval_secs: u64,
    /// Age after which a heartbeat is considered stale
    pub heartbeat_stale_secs: u64,
    /// How often the reaper scans non-terminal runs
    pub reaper_interval_secs: u64,
    /// Terminal run records older than this are dropped by the reaper
    pub run_retention_secs: u64,
    /// Poll interval used when a poll trigger omits `interval_secs`
    pub default_poll_interval_secs: u64,
    /// Capacity of each poll trigger's item queue
    pub poll_queue_capacity: usize,
    /// Status events buffered per live subscriber before it lags
    pub event_buffer: usize,
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    pub fn lock_poll(&self) -> Duration {
        Duration::from_millis(self.lock_poll_ms.max(1))
    }
}

impl EngineConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn heartbeat_stale(&self) -> Duration {
        Duration::from_secs(self.heartbeat_stale_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs.max(1))
    }

    pub fn run_retention(&self) -> Duration {
        Duration::from_secs(self.run_retention_secs)
    }
}

fn env_or<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(fallback)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("FLOWLOOM_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_or("FLOWLOOM_PORT", 3004),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            data_dir: std::env::var("FLOWLOOM_DATA_DIR").unwrap_or_else(|_| "data".to_string()),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: std::env::var("FLOWLOOM_REDIS_URL").ok().filter(|url| !url.is_empty()),
            default_ttl_secs: env_or("FLOWLOOM_CACHE_TTL_SECS", 3600),
            lock_ttl_secs: env_or("FLOWLOOM_LOCK_TTL_SECS", 30),
            lock_wait_ms: env_or("FLOWLOOM_LOCK_WAIT_MS", 10_000),
            lock_poll_ms: env_or("FLOWLOOM_LOCK_POLL_MS", 50),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: env_or("FLOWLOOM_MAX_CONCURRENCY", 64),
            heartbeat_interval_secs: env_or("FLOWLOOM_HEARTBEAT_SECS", 5),
            heartbeat_stale_secs: env_or("FLOWLOOM_HEARTBEAT_STALE_SECS", 30),
            reaper_interval_secs: env_or("FLOWLOOM_REAPER_SECS", 10),
            run_retention_secs: env_or("FLOWLOOM_RUN_RETENTION_SECS", 86_400),
            default_poll_interval_secs: env_or("FLOWLOOM_POLL_SECS", 60),
            poll_queue_capacity: env_or("FLOWLOOM_POLL_QUEUE", 256),
            event_buffer: env_or("FLOWLOOM_EVENT_BUFFER", 1024),
        }
    }
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            cache: CacheConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}
