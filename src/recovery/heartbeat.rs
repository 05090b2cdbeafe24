/// Run liveness heartbeats
///
/// A live run writes its latest timestamp under `heartbeat:{run_id}` on the
/// shared cache substrate, so a reaper in any process sharing the first tier
/// can observe it.

use crate::cache::{heartbeat_key, TieredCache};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct HeartbeatStore {
    cache: Arc<TieredCache>,
    /// Heartbeat records outlive their writer by this much
    retention: Duration,
}

impl HeartbeatStore {
    pub fn new(cache: Arc<TieredCache>, retention: Duration) -> Self {
        Self { cache, retention }
    }

    pub async fn beat(&self, run_id: &str) {
        self.beat_at(run_id, Utc::now()).await;
    }

    /// Record an explicit timestamp
    pub async fn beat_at(&self, run_id: &str, at: DateTime<Utc>) {
        let value = json!(at.timestamp_millis());
        if !self.cache.set(&heartbeat_key(run_id), &value, Some(self.retention)).await {
            tracing::warn!(run_id = %run_id, "⚠️ Heartbeat write failed on every tier");
        }
    }

    pub async fn last_beat(&self, run_id: &str) -> Option<DateTime<Utc>> {
        let value = self.cache.get(&heartbeat_key(run_id)).await?;
        DateTime::from_timestamp_millis(value.as_i64()?)
    }

    pub async fn clear(&self, run_id: &str) {
        self.cache.delete(&heartbeat_key(run_id)).await;
    }

    /// Beat now and every `interval` until `stop` fires
    pub fn spawn(&self, run_id: String, interval: Duration, stop: CancellationToken) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            loop {
                store.beat(&run_id).await;
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = stop.cancelled() => break,
                }
            }
            tracing::debug!(run_id = %run_id, "💓 Heartbeat stopped");
        })
    }
}
