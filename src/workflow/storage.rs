/// SQLite persistence for deployed workflows
///
/// Every deployment is stored as its JSON definition so the manager can
/// re-arm triggers after a restart. Cancelling a deployment deletes its row.

use crate::error::Result;
use crate::workflow::types::Workflow;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct DeploymentStorage {
    pool: SqlitePool,
}

impl DeploymentStorage {
    /// Open (creating if needed) the deployments database file
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

    /// Safe to call multiple times (uses IF NOT EXISTS)
    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS deployments (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                definition TEXT NOT NULL,
                deployed_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert or replace a deployment record
    pub async fn save(&self, workflow: &Workflow, deployed_at: DateTime<Utc>) -> Result<()> {
        let definition = serde_json::to_string(workflow)?;

        sqlx::query(
            r#"
            INSERT INTO deployments (id, name, definition, deployed_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                definition = excluded.definition,
                deployed_at = excluded.deployed_at
            "#,
        )
        .bind(&workflow.id)
        .bind(&workflow.name)
        .bind(&definition)
        .bind(deployed_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Workflow>> {
        let row = sqlx::query("SELECT definition FROM deployments WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let definition: String = row.get("definition");
                Ok(Some(serde_json::from_str(&definition)?))
            }
            None => Ok(None),
        }
    }

    /// All stored deployments, oldest first
    pub async fn load_all(&self) -> Result<Vec<Workflow>> {
        let rows = sqlx::query("SELECT definition FROM deployments ORDER BY deployed_at ASC")
            .fetch_all(&self.pool)
            .await?;

        let mut workflows = Vec::with_capacity(rows.len());
        for row in rows {
            let definition: String = row.get("definition");
            workflows.push(serde_json::from_str(&definition)?);
        }
        Ok(workflows)
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM deployments WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
