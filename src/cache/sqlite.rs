/// Embedded local cache tier backed by SQLite
///
/// Survives process restarts on the same host. Expiry is stored as epoch
/// milliseconds and enforced at read time; expired rows are overwritten in
/// place by the next conditional write.

use super::{CacheResult, CacheStore};
use crate::error::CacheError;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::time::Duration;

const TIER: &str = "sqlite";

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn expiry_ms(ttl: Duration) -> i64 {
    now_ms().saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}

fn unavailable(e: sqlx::Error) -> CacheError {
    CacheError::unavailable(TIER, e)
}

impl SqliteStore {
    /// Open (creating if needed) a cache database file
    pub async fn connect(path: impl AsRef<Path>) -> CacheResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await.map_err(unavailable)?;
        Self::from_pool(pool).await
    }

    /// Private in-memory database; one connection so every query sees it
    pub async fn in_memory() -> CacheResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(unavailable)?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> CacheResult<Self> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> CacheResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cache_entries (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(())
    }

    /// Drop every expired row; returns how many were removed
    pub async fn purge_expired(&self) -> CacheResult<u64> {
        let result = sqlx::query(
            "DELETE FROM cache_entries WHERE expires_at IS NOT NULL AND expires_at <= ?",
        )
        .bind(now_ms())
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl CacheStore for SqliteStore {
    fn name(&self) -> &'static str {
        TIER
    }

    async fn ping(&self) -> CacheResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let row = sqlx::query(
            r#"
            SELECT value FROM cache_entries
            WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)
            "#,
        )
        .bind(key)
        .bind(now_ms())
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(row.map(|row| row.get::<String, _>("value")))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()> {
        sqlx::query(
            r#"
            INSERT INTO cache_entries (key, value, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(ttl.map(expiry_ms))
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        sqlx::query("DELETE FROM cache_entries WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<bool> {
        // Single statement: insert, or take over a row whose expiry has passed
        let result = sqlx::query(
            r#"
            INSERT INTO cache_entries (key, value, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at
            WHERE cache_entries.expires_at IS NOT NULL AND cache_entries.expires_at <= ?
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expiry_ms(ttl))
        .bind(now_ms())
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> CacheResult<bool> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE key = ? AND value = ?")
            .bind(key)
            .bind(expected)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(result.rows_affected() == 1)
    }
}
