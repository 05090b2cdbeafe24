/// SQLite persistence for run records
///
/// The engine writes a run's snapshot when it starts and when it reaches a
/// terminal status, so a fresh process can still see runs its predecessor
/// left behind. A terminal row is never overwritten.

use crate::error::Result;
use crate::runtime::run::{RunFailure, RunRecord, RunStatus};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct RunStorage {
    pool: SqlitePool,
}

impl RunStorage {
    /// Open (creating if needed) the runs database file
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        Self::from_pool(pool).await
    }

    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                terminal INTEGER NOT NULL,
                record TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                completed_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_terminal ON runs (terminal)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Upsert a snapshot; returns false when the stored row is already
    /// terminal and was left untouched
    pub async fn save(&self, record: &RunRecord) -> Result<bool> {
        let body = serde_json::to_string(record)?;

        let result = sqlx::query(
            r#"
            INSERT INTO runs (run_id, workflow_id, terminal, record, created_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(run_id) DO UPDATE SET
                terminal = excluded.terminal,
                record = excluded.record,
                completed_at = excluded.completed_at
            WHERE runs.terminal = 0
            "#,
        )
        .bind(&record.run_id)
        .bind(&record.workflow_id)
        .bind(record.status.is_terminal())
        .bind(&body)
        .bind(record.created_at.timestamp_millis())
        .bind(record.completed_at.map(|at| at.timestamp_millis()))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let row = sqlx::query("SELECT record FROM runs WHERE run_id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let body: String = row.get("record");
                Ok(Some(serde_json::from_str(&body)?))
            }
            None => Ok(None),
        }
    }

    /// Every run whose last persisted snapshot is not terminal, oldest first
    pub async fn non_terminal(&self) -> Result<Vec<RunRecord>> {
        let rows = sqlx::query("SELECT record FROM runs WHERE terminal = 0 ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let body: String = row.get("record");
            records.push(serde_json::from_str(&body)?);
        }
        Ok(records)
    }

    /// Force a persisted non-terminal run to `error` / `crashed`. Returns the
    /// new record, or None if the run is unknown or already terminal.
    pub async fn mark_crashed(&self, run_id: &str, message: &str) -> Result<Option<RunRecord>> {
        let Some(mut record) = self.get(run_id).await? else {
            return Ok(None);
        };
        if record.status.is_terminal() {
            return Ok(None);
        }
        record.status = RunStatus::Error;
        record.failure = Some(RunFailure::crashed(message));
        record.completed_at = Some(Utc::now());

        if self.save(&record).await? {
            Ok(Some(record))
        } else {
            // finished concurrently
            Ok(None)
        }
    }

    /// Delete terminal rows completed before `cutoff`
    pub async fn prune_terminal(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM runs WHERE terminal = 1 AND completed_at < ?")
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
