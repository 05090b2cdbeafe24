/// Timer triggers on tokio-cron-scheduler
///
/// One scheduler per process. Each armed `cronTrigger` node becomes a job
/// keyed `{workflow_id}:{node_id}`; re-arming the same key replaces the old
/// job, and disarming removes it from the scheduler by uuid.

use crate::error::{EngineError, Result};
use crate::runtime::engine::TriggerFiring;
use crate::trigger::RunLauncher;
use crate::workflow::types::Node;
use serde_json::json;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

fn scheduler_error(e: impl std::fmt::Display) -> EngineError {
    EngineError::Scheduler(e.to_string())
}

fn schedule_of(node: &Node) -> Result<&str> {
    node.param_str("schedule").ok_or_else(|| EngineError::TriggerConfig {
        node_id: node.id.clone(),
        message: "missing 'schedule' parameter".into(),
    })
}

fn invalid_schedule(node: &Node, schedule: &str, e: impl std::fmt::Display) -> EngineError {
    EngineError::TriggerConfig {
        node_id: node.id.clone(),
        message: format!("invalid schedule '{}': {}", schedule, e),
    }
}

pub struct CronTriggers {
    scheduler: Arc<RwLock<JobScheduler>>,
    /// `{workflow_id}:{node_id}` -> job uuid
    jobs: Arc<RwLock<HashMap<String, Uuid>>>,
}

impl CronTriggers {
    pub async fn new() -> Result<Self> {
        let scheduler = JobScheduler::new().await.map_err(scheduler_error)?;
        Ok(Self {
            scheduler: Arc::new(RwLock::new(scheduler)),
            jobs: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub async fn start(&self) -> Result<()> {
        self.scheduler.read().await.start().await.map_err(scheduler_error)?;
        tracing::info!("⏰ Cron scheduler started");
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.jobs.write().await.clear();
        self.scheduler.write().await.shutdown().await.map_err(scheduler_error)?;
        tracing::info!("⏹️ Cron scheduler stopped");
        Ok(())
    }

    /// Check the `schedule` parameter parses without scheduling anything
    pub fn validate(node: &Node) -> Result<()> {
        let schedule = schedule_of(node)?;
        Job::new(schedule, |_uuid, _l| {})
            .map(|_| ())
            .map_err(|e| invalid_schedule(node, schedule, e))
    }

    /// Schedule `node` (param `schedule`, six-field cron with seconds).
    /// Each tick launches a run with `{trigger_type, node_id, timestamp}`.
    pub async fn arm(&self, workflow_id: &str, node: &Node, launcher: Arc<dyn RunLauncher>) -> Result<Uuid> {
        let schedule = schedule_of(node)?;

        let job_key = format!("{}:{}", workflow_id, node.id);
        if let Some(old) = self.jobs.write().await.remove(&job_key) {
            self.remove_job(&job_key, &old).await;
        }

        let workflow_id_owned = workflow_id.to_string();
        let node_id = node.id.clone();
        let job = Job::new_async(schedule, move |_uuid, _l| {
            let workflow_id = workflow_id_owned.clone();
            let node_id = node_id.clone();
            let launcher = Arc::clone(&launcher);

            Box::pin(async move {
                let payload = json!({
                    "trigger_type": "cron",
                    "node_id": node_id,
                    "timestamp": chrono::Utc::now().to_rfc3339(),
                });
                match launcher.launch(TriggerFiring::from_node(&node_id, payload)) {
                    Ok(run_id) => tracing::info!(
                        workflow_id = %workflow_id,
                        node_id = %node_id,
                        run_id = %run_id,
                        "🔔 Cron trigger fired"
                    ),
                    Err(e) => tracing::error!(
                        workflow_id = %workflow_id,
                        node_id = %node_id,
                        error = %e,
                        "❌ Cron trigger could not start run"
                    ),
                }
            })
        })
        .map_err(|e| invalid_schedule(node, schedule, e))?;

        let uuid = self.scheduler.read().await.add(job).await.map_err(scheduler_error)?;
        self.jobs.write().await.insert(job_key.clone(), uuid);

        tracing::info!("⏰ Armed cron job: {} ({})", job_key, schedule);
        Ok(uuid)
    }

    /// Remove a job by uuid; unknown uuids are ignored
    pub async fn disarm(&self, uuid: &Uuid) {
        let key = {
            let mut jobs = self.jobs.write().await;
            let key = jobs.iter().find(|(_, id)| *id == uuid).map(|(k, _)| k.clone());
            if let Some(key) = &key {
                jobs.remove(key);
            }
            key
        };
        if let Some(key) = key {
            self.remove_job(&key, uuid).await;
        }
    }

    async fn remove_job(&self, key: &str, uuid: &Uuid) {
        match self.scheduler.read().await.remove(uuid).await {
            Ok(()) => tracing::debug!("🛑 Removed cron job: {}", key),
            Err(e) => tracing::warn!("⚠️ Failed to remove cron job {}: {}", key, e),
        }
    }

    pub async fn job_count(&self) -> usize {
        self.jobs.read().await.len()
    }
}
