/// Deployment Manager
///
/// Arms one trigger strategy per trigger node of a deployed workflow and
/// hands every firing to the engine as a brand-new, independent run.
/// Cancelling a deployment disarms its triggers and releases its waiters;
/// runs already spawned drain on their own.

use crate::config::EngineConfig;
use crate::deployment::state::{ArmedTrigger, DeploymentState, DeploymentStatus};
use crate::error::{EngineError, Result};
use crate::runtime::engine::{ExecutionEngine, TriggerFiring};
use crate::runtime::run::RunRecord;
use crate::trigger::{
    CronTriggers, EventTrigger, PollSources, PollTrigger, RunLauncher, Teardown, WaiterInfo,
};
use crate::workflow::registry::{CompiledWorkflow, WorkflowRegistry};
use crate::workflow::storage::DeploymentStorage;
use crate::workflow::types::{Node, TriggerKind, Workflow};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Launches runs of one deployed workflow definition
struct DeployedLauncher {
    engine: Arc<ExecutionEngine>,
    workflow: Arc<Workflow>,
}

impl RunLauncher for DeployedLauncher {
    fn launch(&self, firing: TriggerFiring) -> Result<String> {
        let handle = self.engine.start_run(Arc::clone(&self.workflow), firing)?;
        Ok(handle.run_id().to_string())
    }
}

pub struct DeploymentManager {
    engine: Arc<ExecutionEngine>,
    cron: CronTriggers,
    poll_sources: PollSources,
    registry: WorkflowRegistry,
    storage: Option<DeploymentStorage>,
    /// Serializes deploy/cancel per process
    deployments: Mutex<HashMap<String, DeploymentState>>,
}

impl DeploymentManager {
    pub async fn new(
        engine: Arc<ExecutionEngine>,
        poll_sources: PollSources,
        storage: Option<DeploymentStorage>,
    ) -> Result<Self> {
        Ok(Self {
            engine,
            cron: CronTriggers::new().await?,
            poll_sources,
            registry: WorkflowRegistry::new(),
            storage,
            deployments: Mutex::new(HashMap::new()),
        })
    }

    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }

    /// Start the timer scheduler; cron triggers only fire after this
    pub async fn start(&self) -> Result<()> {
        self.cron.start().await
    }

    /// Validate, arm and persist a workflow. Redeploying replaces the
    /// previous deployment of the same id.
    #[tracing::instrument(skip_all, fields(workflow_id = %workflow.id))]
    pub async fn deploy(&self, workflow: Workflow) -> Result<DeploymentStatus> {
        let state = self.arm(workflow, true).await?;
        Ok(state.status(Vec::new()))
    }

    async fn arm(&self, workflow: Workflow, persist: bool) -> Result<DeploymentState> {
        self.engine.check(&workflow)?;
        self.validate_triggers(&workflow)?;

        let workflow_id = workflow.id.clone();
        let mut deployments = self.deployments.lock().await;
        let previous = deployments.remove(&workflow_id);
        if let Some(previous) = &previous {
            tracing::info!("♻️ Replacing deployment of workflow '{}'", workflow_id);
            self.disarm(previous).await;
        }

        let error = match self.arm_compiled(CompiledWorkflow::compile(workflow), persist).await {
            Ok(state) => {
                deployments.insert(workflow_id, state.clone());
                return Ok(state);
            }
            Err(e) => e,
        };

        // The registry and storage still hold the previous definition; re-arm
        // it so memory matches what a restart would restore.
        if previous.is_some() {
            if let Some(prior) = self.registry.get(&workflow_id) {
                match self.arm_compiled(prior, false).await {
                    Ok(state) => {
                        tracing::warn!("↩️ Redeploy of '{}' failed, previous deployment re-armed", workflow_id);
                        deployments.insert(workflow_id, state);
                    }
                    Err(restore_error) => {
                        tracing::error!(
                            error = %restore_error,
                            "❌ Could not re-arm previous deployment of '{}'",
                            workflow_id
                        );
                        self.forget(&workflow_id).await;
                    }
                }
            }
        }
        Err(error)
    }

    /// Reject trigger configuration that could never arm, before anything
    /// already deployed is torn down
    fn validate_triggers(&self, workflow: &Workflow) -> Result<()> {
        let config: &EngineConfig = self.engine.config();
        for node in workflow.trigger_nodes() {
            match node.trigger_kind() {
                Some(TriggerKind::Cron) => CronTriggers::validate(node)?,
                Some(TriggerKind::Event) => {
                    EventTrigger::from_node(&workflow.id, node)?;
                }
                Some(TriggerKind::Poll) => {
                    PollTrigger::from_node(
                        &workflow.id,
                        node,
                        Duration::from_secs(config.default_poll_interval_secs),
                        config.poll_queue_capacity,
                    )
                    .source(&self.poll_sources)?;
                }
                Some(TriggerKind::Manual) | None => {}
            }
        }
        Ok(())
    }

    /// Arm every trigger of `compiled`, persist it and publish it to the
    /// registry. On failure nothing of the new definition stays armed.
    async fn arm_compiled(&self, compiled: CompiledWorkflow, persist: bool) -> Result<DeploymentState> {
        let workflow = Arc::clone(&compiled.workflow);
        let launcher: Arc<dyn RunLauncher> = Arc::new(DeployedLauncher {
            engine: Arc::clone(&self.engine),
            workflow: Arc::clone(&workflow),
        });

        let mut state = DeploymentState::new(&workflow.id, &workflow.name);
        for (node_id, kind) in &compiled.triggers {
            let Some(node) = workflow.node(node_id) else { continue };
            match self.arm_trigger(&workflow.id, node, *kind, Arc::clone(&launcher)).await {
                Ok(teardown) => state.triggers.push(ArmedTrigger {
                    node_id: node_id.clone(),
                    kind: *kind,
                    teardown,
                }),
                Err(e) => {
                    self.disarm(&state).await;
                    return Err(e);
                }
            }
        }

        if persist {
            if let Some(storage) = &self.storage {
                if let Err(e) = storage.save(&workflow, state.deployed_at).await {
                    self.disarm(&state).await;
                    return Err(e);
                }
            }
        }

        self.registry.insert(compiled);
        tracing::info!(
            "🚀 Deployed workflow '{}' with {} trigger(s)",
            workflow.id,
            state.triggers.len()
        );
        Ok(state)
    }

    /// Drop a workflow from the registry and storage
    async fn forget(&self, workflow_id: &str) {
        self.registry.remove(workflow_id);
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.delete(workflow_id).await {
                tracing::error!(error = %e, "❌ Failed to delete stored deployment '{}'", workflow_id);
            }
        }
    }

    async fn arm_trigger(
        &self,
        workflow_id: &str,
        node: &Node,
        kind: TriggerKind,
        launcher: Arc<dyn RunLauncher>,
    ) -> Result<Teardown> {
        let config: &EngineConfig = self.engine.config();
        match kind {
            TriggerKind::Manual => Ok(Teardown::None),
            TriggerKind::Cron => Ok(Teardown::CronJob(self.cron.arm(workflow_id, node, launcher).await?)),
            TriggerKind::Event => {
                let stop = CancellationToken::new();
                EventTrigger::from_node(workflow_id, node)?.arm(
                    Arc::clone(self.engine.waiters()),
                    launcher,
                    stop.clone(),
                )?;
                Ok(Teardown::Task(stop))
            }
            TriggerKind::Poll => {
                let stop = CancellationToken::new();
                PollTrigger::from_node(
                    workflow_id,
                    node,
                    Duration::from_secs(config.default_poll_interval_secs),
                    config.poll_queue_capacity,
                )
                .arm(&self.poll_sources, launcher, stop.clone())?;
                Ok(Teardown::Task(stop))
            }
        }
    }

    async fn disarm(&self, state: &DeploymentState) {
        for trigger in &state.triggers {
            match &trigger.teardown {
                Teardown::CronJob(uuid) => self.cron.disarm(uuid).await,
                Teardown::Task(stop) => stop.cancel(),
                Teardown::None => {}
            }
            // release the parked waiter now so a redeploy can register again
            if trigger.kind == TriggerKind::Event {
                self.engine.waiters().cancel_for_trigger(&state.workflow_id, &trigger.node_id);
            }
        }
    }

    /// Disarm every trigger of a workflow and cancel its open waiters.
    /// Runs already spawned are left to finish.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, workflow_id: &str) -> Result<()> {
        let state = self
            .deployments
            .lock()
            .await
            .remove(workflow_id)
            .ok_or_else(|| EngineError::DeploymentNotFound(workflow_id.to_string()))?;

        self.disarm(&state).await;
        let waiters = self.engine.waiters().cancel_for_workflow(workflow_id);
        self.registry.remove(workflow_id);
        if let Some(storage) = &self.storage {
            storage.delete(workflow_id).await?;
        }

        tracing::info!("🛑 Cancelled deployment '{}' ({} waiter(s) released)", workflow_id, waiters);
        Ok(())
    }

    pub async fn get_status(&self, workflow_id: &str) -> Result<DeploymentStatus> {
        let deployments = self.deployments.lock().await;
        let state = deployments
            .get(workflow_id)
            .ok_or_else(|| EngineError::DeploymentNotFound(workflow_id.to_string()))?;
        Ok(state.status(self.active_runs(workflow_id)))
    }

    pub async fn list(&self) -> Vec<DeploymentStatus> {
        let deployments = self.deployments.lock().await;
        let mut statuses: Vec<DeploymentStatus> = deployments
            .values()
            .map(|state| state.status(self.active_runs(&state.workflow_id)))
            .collect();
        statuses.sort_by(|a, b| a.workflow_id.cmp(&b.workflow_id));
        statuses
    }

    fn active_runs(&self, workflow_id: &str) -> Vec<String> {
        self.engine
            .runs()
            .by_workflow(workflow_id)
            .into_iter()
            .filter(|record| !record.status.is_terminal())
            .map(|record| record.run_id)
            .collect()
    }

    pub async fn run_status(&self, run_id: &str) -> Option<RunRecord> {
        self.engine.run_record(run_id).await
    }

    /// Start a run of a deployed workflow, feeding `payload` to every
    /// trigger node
    pub fn run_now(&self, workflow_id: &str, payload: Value) -> Result<String> {
        let compiled = self
            .registry
            .get(workflow_id)
            .ok_or_else(|| EngineError::DeploymentNotFound(workflow_id.to_string()))?;
        let handle = self.engine.start_run(compiled.workflow, TriggerFiring::manual(payload))?;
        tracing::info!(run_id = %handle.run_id(), "▶️ Manual run of '{}' started", workflow_id);
        Ok(handle.run_id().to_string())
    }

    pub fn cancel_run(&self, run_id: &str) -> bool {
        self.engine.cancel_run(run_id)
    }

    pub fn dispatch_event(&self, event_type: &str, payload: &Value) -> usize {
        self.engine.waiters().dispatch(event_type, payload)
    }

    pub fn cancel_event_wait(&self, waiter_id: &str) -> bool {
        self.engine.waiters().cancel(waiter_id)
    }

    pub fn cancel_event_wait_for_node(&self, node_id: &str) -> usize {
        self.engine.waiters().cancel_for_node(node_id)
    }

    pub fn active_waiters(&self) -> Vec<WaiterInfo> {
        self.engine.waiters().active_waiters()
    }

    /// Re-arm every persisted deployment; failures are logged and skipped.
    /// Returns how many were restored.
    pub async fn restore(&self) -> Result<usize> {
        let Some(storage) = &self.storage else {
            return Ok(0);
        };

        let mut restored = 0;
        for workflow in storage.load_all().await? {
            let workflow_id = workflow.id.clone();
            match self.arm(workflow, false).await {
                Ok(_) => restored += 1,
                Err(e) => tracing::error!(workflow_id = %workflow_id, error = %e, "❌ Failed to restore deployment"),
            }
        }

        tracing::info!("📦 Restored {} deployment(s)", restored);
        Ok(restored)
    }

    /// Disarm everything without touching persisted records
    pub async fn shutdown(&self) -> Result<()> {
        let states: Vec<DeploymentState> = self.deployments.lock().await.drain().map(|(_, s)| s).collect();
        for state in &states {
            self.disarm(state).await;
            self.registry.remove(&state.workflow_id);
        }
        self.cron.shutdown().await
    }
}
