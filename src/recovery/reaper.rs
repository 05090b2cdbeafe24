/// Orphaned-run reaper
///
/// Scans every non-terminal run and compares its last heartbeat with the
/// stale threshold. A run with no heartbeat at all is judged by how long ago
/// it started. Orphans are forced to `error` with reason `crashed`, their
/// run-scoped waiters are cancelled, and nothing is resumed.
///
/// With run storage attached, persisted runs this process never started
/// (left behind by a crashed predecessor) are judged the same way.

use crate::error::EngineError;
use crate::recovery::heartbeat::HeartbeatStore;
use crate::runtime::events::{StatusEvent, StatusSink};
use crate::runtime::run::{RunRecord, RunRegistry};
use crate::runtime::run_store::RunStorage;
use crate::trigger::waiter::EventWaiter;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct Reaper {
    runs: Arc<RunRegistry>,
    heartbeats: HeartbeatStore,
    waiters: Arc<EventWaiter>,
    sink: Arc<dyn StatusSink>,
    stale_after: chrono::Duration,
    /// Terminal records older than this are pruned after each pass
    retention: Option<chrono::Duration>,
    storage: Option<RunStorage>,
}

impl Reaper {
    pub fn new(
        runs: Arc<RunRegistry>,
        heartbeats: HeartbeatStore,
        waiters: Arc<EventWaiter>,
        sink: Arc<dyn StatusSink>,
        stale_after: Duration,
    ) -> Self {
        Self {
            runs,
            heartbeats,
            waiters,
            sink,
            stale_after: chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::days(1)),
            retention: None,
            storage: None,
        }
    }

    pub fn with_storage(mut self, storage: RunStorage) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = chrono::Duration::from_std(retention).ok();
        self
    }

    /// Drop archived terminal records past the retention window
    pub async fn prune(&self) -> usize {
        let Some(retention) = self.retention else { return 0 };
        let mut pruned = self.runs.prune_terminal(retention);
        if let Some(storage) = &self.storage {
            match storage.prune_terminal(Utc::now() - retention).await {
                Ok(rows) => pruned += rows as usize,
                Err(e) => tracing::error!("❌ Failed to prune persisted runs: {}", e),
            }
        }
        pruned
    }

    async fn staleness(&self, record: &RunRecord, now: DateTime<Utc>) -> Option<chrono::Duration> {
        let last_seen = match self.heartbeats.last_beat(&record.run_id).await {
            Some(at) => at,
            None => record.started_at.unwrap_or(record.created_at),
        };
        let age = now - last_seen;
        (age > self.stale_after).then_some(age)
    }

    async fn release(&self, record: &RunRecord, age: chrono::Duration, source: &str) {
        let cancelled = self.waiters.cancel_for_run(&record.run_id);
        self.heartbeats.clear(&record.run_id).await;
        tracing::warn!(
            run_id = %record.run_id,
            workflow_id = %record.workflow_id,
            stale_secs = age.num_seconds(),
            waiters_cancelled = cancelled,
            source,
            "💀 Reaped orphaned run"
        );
        self.sink.publish(StatusEvent::Run {
            run_id: record.run_id.clone(),
            workflow_id: record.workflow_id.clone(),
            status: record.status,
            failure: record.failure.clone(),
        });
    }

    /// Persisted non-terminal runs this process has no live record of
    async fn persisted_orphans(&self, storage: &RunStorage) -> Vec<RunRecord> {
        match storage.non_terminal().await {
            Ok(records) => records
                .into_iter()
                .filter(|record| self.runs.get(&record.run_id).is_none())
                .collect(),
            Err(e) => {
                tracing::error!("❌ Failed to scan persisted runs: {}", e);
                Vec::new()
            }
        }
    }

    /// One reaper pass; returns the ids of runs declared crashed
    pub async fn reap_once(&self) -> Vec<String> {
        let now = Utc::now();
        let mut crashed = Vec::new();

        for record in self.runs.non_terminal() {
            let Some(age) = self.staleness(&record, now).await else { continue };
            let error = EngineError::CrashedRun {
                run_id: record.run_id.clone(),
                stale_secs: age.num_seconds(),
            };
            let Some(updated) = self.runs.force_crashed(&record.run_id, &error.to_string()) else {
                // finished between the scan and now
                continue;
            };
            if let Some(storage) = &self.storage {
                if let Err(e) = storage.save(&updated).await {
                    tracing::error!(run_id = %updated.run_id, "❌ Failed to persist crash: {}", e);
                }
            }
            self.release(&updated, age, "registry").await;
            crashed.push(updated.run_id);
        }

        let Some(storage) = &self.storage else { return crashed };
        for record in self.persisted_orphans(storage).await {
            let Some(age) = self.staleness(&record, now).await else { continue };
            let error = EngineError::CrashedRun {
                run_id: record.run_id.clone(),
                stale_secs: age.num_seconds(),
            };
            let updated = match storage.mark_crashed(&record.run_id, &error.to_string()).await {
                Ok(Some(updated)) => updated,
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!(run_id = %record.run_id, "❌ Failed to mark persisted run crashed: {}", e);
                    continue;
                }
            };
            self.release(&updated, age, "storage").await;
            crashed.push(updated.run_id);
        }

        crashed
    }

    /// Run `reap_once` every `interval` until `stop` fires
    pub fn spawn(self: Arc<Self>, interval: Duration, stop: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("🧹 Reaper started, scanning every {:?}", interval);
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let crashed = self.reap_once().await;
                        if !crashed.is_empty() {
                            tracing::info!("🧹 Reaper pass marked {} run(s) crashed", crashed.len());
                        }
                        let pruned = self.prune().await;
                        if pruned > 0 {
                            tracing::debug!("🗑️ Pruned {} archived run record(s)", pruned);
                        }
                    }
                    _ = stop.cancelled() => break,
                }
            }
            tracing::info!("⏹️ Reaper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TieredCache;
    use crate::config::CacheConfig;
    use crate::runtime::events::NoopSink;
    use crate::runtime::run::{FailureReason, Run, RunStatus};
    use serde_json::json;

    fn reaper(runs: Arc<RunRegistry>, heartbeats: HeartbeatStore) -> Reaper {
        Reaper::new(
            runs,
            heartbeats,
            Arc::new(EventWaiter::new()),
            Arc::new(NoopSink),
            Duration::from_secs(30),
        )
    }

    fn heartbeats() -> HeartbeatStore {
        HeartbeatStore::new(
            Arc::new(TieredCache::in_memory(CacheConfig::default())),
            Duration::from_secs(600),
        )
    }

    #[tokio::test]
    async fn fresh_heartbeat_keeps_run_alive() {
        let runs = Arc::new(RunRegistry::new());
        let beats = heartbeats();
        let run = Run::new("wf", None, json!({}));
        runs.insert(&run);
        beats.beat(&run.id).await;

        assert!(reaper(runs.clone(), beats).reap_once().await.is_empty());
        assert_eq!(runs.get(&run.id).unwrap().status, RunStatus::Pending);
    }

    #[tokio::test]
    async fn stale_heartbeat_marks_run_crashed() {
        let runs = Arc::new(RunRegistry::new());
        let beats = heartbeats();
        let run = Run::new("wf", None, json!({}));
        runs.insert(&run);
        beats.beat_at(&run.id, Utc::now() - chrono::Duration::seconds(120)).await;

        let crashed = reaper(runs.clone(), beats).reap_once().await;
        assert_eq!(crashed, vec![run.id.clone()]);

        let record = runs.get(&run.id).unwrap();
        assert_eq!(record.status, RunStatus::Error);
        assert_eq!(record.failure.unwrap().reason, FailureReason::Crashed);
        assert!(run.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn missing_heartbeat_is_judged_by_start_time() {
        let runs = Arc::new(RunRegistry::new());
        let run = Run::new("wf", None, json!({}));
        runs.insert(&run);

        let mut record = runs.get(&run.id).unwrap();
        record.status = RunStatus::Running;
        record.started_at = Some(Utc::now() - chrono::Duration::seconds(300));
        assert!(runs.update(record));

        let crashed = reaper(runs.clone(), heartbeats()).reap_once().await;
        assert_eq!(crashed.len(), 1);
    }

    #[tokio::test]
    async fn prune_only_drops_terminal_records_past_retention() {
        let runs = Arc::new(RunRegistry::new());
        let live = Run::new("wf", None, json!({}));
        let done = Run::new("wf", None, json!({}));
        runs.insert(&live);
        runs.insert(&done);

        let mut record = runs.get(&done.id).unwrap();
        record.status = RunStatus::Success;
        record.completed_at = Some(Utc::now() - chrono::Duration::hours(2));
        assert!(runs.update(record));

        let keep_all = reaper(runs.clone(), heartbeats());
        assert_eq!(keep_all.prune().await, 0);

        let pruning = reaper(runs.clone(), heartbeats()).with_retention(Duration::from_secs(3_600));
        assert_eq!(pruning.prune().await, 1);
        assert!(runs.get(&done.id).is_none());
        assert!(runs.get(&live.id).is_some());
    }
}
