/// Decide-loop scheduler
///
/// Drives one run of a planned workflow to a terminal status. Rather than
/// executing layer by layer, the loop keeps every ready node in flight and
/// reacts to whichever completes first: a downstream node is dispatched the
/// moment its own incoming edges resolve, even while siblings still run.
///
/// Readiness is tracked per edge. An incoming edge is pending until its
/// source finishes, then either active (data delivered) or dead (condition
/// false, upstream skipped, upstream error on a data edge, upstream success
/// on an error edge). A pending node is ready once all its incoming edges
/// resolved with at least one active; with none active it is skipped, and the
/// skip propagates the same way.

use crate::cache::TieredCache;
use crate::config::EngineConfig;
use crate::error::{EngineError, NodeError, Result};
use crate::recovery::heartbeat::HeartbeatStore;
use crate::runtime::condition;
use crate::runtime::events::{StatusEvent, StatusSink};
use crate::runtime::executor::{NodeExecutor, NodeRegistry, RunScope};
use crate::runtime::planner::{ExecutionPlan, GraphPlanner};
use crate::runtime::run::{NodeStatus, Run, RunFailure, RunRecord, RunRegistry, RunStatus};
use crate::runtime::run_store::RunStorage;
use crate::trigger::waiter::EventWaiter;
use crate::workflow::types::{EdgeKind, Node, Workflow};
use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// What started a run: the firing trigger node (if any) and its payload
#[derive(Debug, Clone)]
pub struct TriggerFiring {
    /// Firing trigger node; `None` feeds the payload to every trigger node
    pub node_id: Option<String>,
    pub payload: Value,
}

impl TriggerFiring {
    pub fn manual(payload: Value) -> Self {
        Self { node_id: None, payload }
    }

    pub fn from_node(node_id: impl Into<String>, payload: Value) -> Self {
        Self {
            node_id: Some(node_id.into()),
            payload,
        }
    }
}

/// A run spawned onto the runtime
pub struct RunHandle {
    run_id: String,
    join: JoinHandle<RunRecord>,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Wait for the run's final record
    pub async fn wait(self) -> Result<RunRecord> {
        self.join.await.map_err(|e| EngineError::RunAborted {
            run_id: self.run_id,
            message: e.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum EdgeState {
    Pending,
    Active(Value),
    Dead,
}

type Completion = (String, std::result::Result<Value, NodeError>);

pub struct ExecutionEngine {
    executor: Arc<NodeExecutor>,
    planner: GraphPlanner,
    runs: Arc<RunRegistry>,
    heartbeats: HeartbeatStore,
    sink: Arc<dyn StatusSink>,
    run_storage: Option<RunStorage>,
    config: EngineConfig,
}

impl ExecutionEngine {
    pub fn new(
        registry: NodeRegistry,
        cache: Arc<TieredCache>,
        waiters: Arc<EventWaiter>,
        sink: Arc<dyn StatusSink>,
        config: EngineConfig,
    ) -> Self {
        // Heartbeats must survive a few missed intervals past the stale mark
        let retention = config.heartbeat_stale() * 4 + config.heartbeat_interval();
        let heartbeats = HeartbeatStore::new(Arc::clone(&cache), retention);
        let executor = Arc::new(NodeExecutor::new(registry, cache, waiters, config.max_concurrency));

        Self {
            executor,
            planner: GraphPlanner::default(),
            runs: Arc::new(RunRegistry::new()),
            heartbeats,
            sink,
            run_storage: None,
            config,
        }
    }

    /// Persist run snapshots so recovery can see them after a restart
    pub fn with_run_storage(mut self, storage: RunStorage) -> Self {
        self.run_storage = Some(storage);
        self
    }

    pub fn runs(&self) -> &Arc<RunRegistry> {
        &self.runs
    }

    pub fn heartbeats(&self) -> &HeartbeatStore {
        &self.heartbeats
    }

    pub fn waiters(&self) -> &Arc<EventWaiter> {
        self.executor.waiters()
    }

    pub fn sink(&self) -> &Arc<dyn StatusSink> {
        &self.sink
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn run_status(&self, run_id: &str) -> Option<RunRecord> {
        self.runs.get(run_id)
    }

    /// Live record if this process knows the run, otherwise the persisted one
    pub async fn run_record(&self, run_id: &str) -> Option<RunRecord> {
        if let Some(record) = self.runs.get(run_id) {
            return Some(record);
        }
        let storage = self.run_storage.as_ref()?;
        match storage.get(run_id).await {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(run_id = %run_id, "❌ Failed to load run record: {}", e);
                None
            }
        }
    }

    async fn persist(&self, record: &RunRecord) {
        let Some(storage) = &self.run_storage else { return };
        if let Err(e) = storage.save(record).await {
            tracing::error!(run_id = %record.run_id, "❌ Failed to persist run record: {}", e);
        }
    }

    /// Plan a workflow and verify every non-trigger node has a handler
    pub fn check(&self, workflow: &Workflow) -> Result<ExecutionPlan> {
        let plan = self.planner.plan(workflow)?;
        let registry = self.executor.registry();
        if let Some(node) = workflow
            .nodes
            .iter()
            .find(|node| !node.is_trigger() && !registry.contains(&node.kind))
        {
            return Err(EngineError::UnknownNodeKind(node.kind.clone()));
        }
        Ok(plan)
    }

    /// Request cooperative cancellation; false if unknown or already terminal
    pub fn cancel_run(&self, run_id: &str) -> bool {
        let live = self
            .runs
            .get(run_id)
            .is_some_and(|record| !record.status.is_terminal());
        if !live {
            return false;
        }
        match self.runs.cancel_token(run_id) {
            Some(token) => {
                tracing::info!(run_id = %run_id, "🛑 Cancelling run");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Plan and spawn a run. Planning errors are returned before any task
    /// starts.
    pub fn start_run(self: &Arc<Self>, workflow: Arc<Workflow>, firing: TriggerFiring) -> Result<RunHandle> {
        let (run, plan) = self.prepare(&workflow, firing)?;
        let run_id = run.id.clone();
        let span = tracing::info_span!("run", run_id = %run_id, workflow_id = %workflow.id);

        let engine = Arc::clone(self);
        let join = tokio::spawn(async move { engine.drive(workflow, plan, run).await }.instrument(span));

        Ok(RunHandle { run_id, join })
    }

    /// Plan and drive a run on the current task
    #[tracing::instrument(skip_all, fields(workflow_id = %workflow.id))]
    pub async fn execute(&self, workflow: Arc<Workflow>, firing: TriggerFiring) -> Result<RunRecord> {
        let (run, plan) = self.prepare(&workflow, firing)?;
        Ok(self.drive(workflow, plan, run).await)
    }

    fn prepare(&self, workflow: &Workflow, firing: TriggerFiring) -> Result<(Run, ExecutionPlan)> {
        let plan = self.planner.plan(workflow)?;

        if let Some(node_id) = firing.node_id.as_deref() {
            if !plan.triggers.iter().any(|t| t == node_id) {
                return Err(EngineError::TriggerConfig {
                    node_id: node_id.to_string(),
                    message: format!("not a trigger node of workflow '{}'", workflow.id),
                });
            }
        }

        let mut run = Run::new(workflow.id.clone(), firing.node_id, firing.payload);
        for node_id in &plan.order {
            run.set_status(node_id, NodeStatus::Pending);
        }
        self.runs.insert(&run);

        Ok((run, plan))
    }

    async fn drive(&self, workflow: Arc<Workflow>, plan: ExecutionPlan, mut run: Run) -> RunRecord {
        let started = std::time::Instant::now();
        tracing::info!(
            run_id = %run.id,
            "🚀 Starting workflow execution: {} ({} scheduled nodes)",
            workflow.id,
            plan.order.len()
        );

        run.status = RunStatus::Running;
        run.started_at = Some(Utc::now());
        self.publish_run(&run);
        self.runs.update(run.snapshot());
        self.persist(&run.snapshot()).await;

        let stop_heartbeat = CancellationToken::new();
        let _heartbeat_guard = stop_heartbeat.clone().drop_guard();
        let heartbeat = self.heartbeats.spawn(
            run.id.clone(),
            self.config.heartbeat_interval(),
            stop_heartbeat.clone(),
        );

        let mut edges = vec![EdgeState::Pending; workflow.edges.len()];
        self.pre_execute_triggers(&workflow, &plan, &mut run, &mut edges);

        let scope = RunScope {
            run_id: run.id.clone(),
            workflow_id: workflow.id.clone(),
            cancel: run.cancel.clone(),
        };
        let mut in_flight: FuturesUnordered<BoxFuture<'static, Completion>> = FuturesUnordered::new();
        let mut unhandled: Option<RunFailure> = None;
        let mut cancelled = false;

        loop {
            if run.cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            for node_id in self.advance(&workflow, &plan, &mut run, &mut edges) {
                let Some(node) = workflow.node(&node_id) else { continue };
                in_flight.push(self.dispatch(&workflow, &plan, &scope, node, &edges, &mut run));
            }
            self.runs.update(run.snapshot());

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                _ = run.cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                Some((node_id, result)) = in_flight.next() => {
                    match result {
                        Ok(output) => self.on_success(&workflow, &plan, &mut run, &mut edges, &node_id, output),
                        Err(NodeError::Cancelled) if run.cancel.is_cancelled() => {
                            cancelled = true;
                            break;
                        }
                        Err(error) => {
                            let handled = self.on_error(&workflow, &plan, &mut run, &mut edges, &node_id, &error);
                            if !handled && unhandled.is_none() {
                                unhandled = Some(RunFailure::node(&node_id, error.to_string()));
                            }
                        }
                    }
                }
            }
        }

        if cancelled {
            // In-flight results are discarded
            drop(in_flight);
            self.close_open_nodes(&mut run);
            run.status = RunStatus::Cancelled;
            let error = EngineError::Cancelled { run_id: run.id.clone() };
            run.failure = Some(RunFailure::cancelled(error.to_string()));
        } else if let Some(failure) = unhandled {
            run.status = RunStatus::Error;
            run.failure = Some(failure);
        } else {
            run.status = RunStatus::Success;
        }
        run.completed_at = Some(Utc::now());

        stop_heartbeat.cancel();
        let _ = heartbeat.await;
        self.heartbeats.clear(&run.id).await;

        if self.runs.update(run.snapshot()) {
            self.publish_run(&run);
        }

        let record = self.runs.get(&run.id).unwrap_or_else(|| run.snapshot());
        self.persist(&record).await;
        match record.status {
            RunStatus::Success => tracing::info!(
                run_id = %run.id,
                "🎉 Workflow '{}' completed in {:?}",
                workflow.id,
                started.elapsed()
            ),
            status => tracing::warn!(
                run_id = %run.id,
                failure = ?record.failure,
                "⚠️ Workflow '{}' finished as {:?} after {:?}",
                workflow.id,
                status,
                started.elapsed()
            ),
        }
        record
    }

    fn pre_execute_triggers(
        &self,
        workflow: &Workflow,
        plan: &ExecutionPlan,
        run: &mut Run,
        edges: &mut [EdgeState],
    ) {
        for trigger in &plan.triggers {
            let fired = run.trigger_node.as_deref().is_none_or(|id| id == trigger);
            if fired {
                let payload = run.trigger_payload.clone();
                tracing::debug!(run_id = %run.id, node_id = %trigger, "🎯 Trigger pre-executed");
                self.on_success(workflow, plan, run, edges, trigger, payload);
            } else {
                self.mark_skipped(workflow, plan, run, edges, trigger);
            }
        }
    }

    /// Resolve skips and return the nodes that became ready, in plan order
    fn advance(
        &self,
        workflow: &Workflow,
        plan: &ExecutionPlan,
        run: &mut Run,
        edges: &mut [EdgeState],
    ) -> Vec<String> {
        let mut ready = Vec::new();

        // Plan order is topological, so one pass settles transitive skips
        for node_id in &plan.order {
            if run.status_of(node_id) != Some(NodeStatus::Pending) {
                continue;
            }
            let incoming = plan.incoming.get(node_id).map(Vec::as_slice).unwrap_or_default();
            if incoming.iter().any(|&i| edges[i] == EdgeState::Pending) {
                continue;
            }

            let any_active = incoming.iter().any(|&i| matches!(edges[i], EdgeState::Active(_)));
            if any_active || incoming.is_empty() {
                run.set_status(node_id, NodeStatus::Ready);
                ready.push(node_id.clone());
            } else {
                self.mark_skipped(workflow, plan, run, edges, node_id);
            }
        }

        ready
    }

    fn dispatch(
        &self,
        workflow: &Workflow,
        plan: &ExecutionPlan,
        scope: &RunScope,
        node: &Node,
        edges: &[EdgeState],
        run: &mut Run,
    ) -> BoxFuture<'static, Completion> {
        let mut inputs = Map::new();
        for &index in plan.incoming.get(&node.id).into_iter().flatten() {
            if let EdgeState::Active(value) = &edges[index] {
                inputs.insert(workflow.edges[index].input_key().to_string(), value.clone());
            }
        }

        let sub_nodes: Vec<Node> = plan
            .sub_nodes
            .get(&node.id)
            .into_iter()
            .flatten()
            .filter_map(|id| workflow.node(id).cloned())
            .collect();

        run.set_status(&node.id, NodeStatus::Running);
        self.publish_node(run, &node.id, NodeStatus::Running, None, None);
        tracing::info!(run_id = %run.id, node_id = %node.id, "📍 Dispatching node '{}' ({})", node.id, node.kind);

        let executor = Arc::clone(&self.executor);
        let scope = scope.clone();
        let node = node.clone();
        let node_id = node.id.clone();

        let task = tokio::spawn(
            async move { executor.invoke(&scope, &node, inputs, sub_nodes).await.map(|(v, _)| v) }
                .in_current_span(),
        );

        task.map(move |joined| {
            let result = joined.unwrap_or_else(|e| Err(NodeError::failed(format!("node task panicked: {}", e))));
            (node_id, result)
        })
        .boxed()
    }

    fn on_success(
        &self,
        workflow: &Workflow,
        plan: &ExecutionPlan,
        run: &mut Run,
        edges: &mut [EdgeState],
        node_id: &str,
        output: Value,
    ) {
        for &index in plan.outgoing.get(node_id).into_iter().flatten() {
            let edge = &workflow.edges[index];
            edges[index] = match edge.kind {
                EdgeKind::Error => EdgeState::Dead,
                EdgeKind::Data if condition::evaluate(edge.condition.as_ref(), &output) => {
                    EdgeState::Active(select_handle(&output, edge.source_handle.as_deref()))
                }
                EdgeKind::Data => {
                    tracing::debug!(run_id = %run.id, "🔀 Condition on {} -> {} is false", edge.source, edge.target);
                    EdgeState::Dead
                }
            };
        }

        tracing::info!(run_id = %run.id, node_id = %node_id, "✅ Node '{}' succeeded", node_id);
        run.set_status(node_id, NodeStatus::Success);
        run.outputs.insert(node_id.to_string(), output.clone());
        self.publish_node(run, node_id, NodeStatus::Success, Some(output), None);
    }

    /// Returns whether the error is handled by an outgoing error edge
    fn on_error(
        &self,
        workflow: &Workflow,
        plan: &ExecutionPlan,
        run: &mut Run,
        edges: &mut [EdgeState],
        node_id: &str,
        error: &NodeError,
    ) -> bool {
        let message = error.to_string();
        let payload = json!({ "node_id": node_id, "error": message });
        let mut handled = false;

        for &index in plan.outgoing.get(node_id).into_iter().flatten() {
            edges[index] = match workflow.edges[index].kind {
                EdgeKind::Error => {
                    handled = true;
                    EdgeState::Active(payload.clone())
                }
                EdgeKind::Data => EdgeState::Dead,
            };
        }

        let failure = EngineError::NodeExecution {
            node_id: node_id.to_string(),
            message: message.clone(),
        };
        tracing::error!(run_id = %run.id, handled, "❌ {}", failure);

        run.set_status(node_id, NodeStatus::Error);
        run.errors.insert(node_id.to_string(), message.clone());
        self.publish_node(run, node_id, NodeStatus::Error, None, Some(message));
        handled
    }

    fn mark_skipped(
        &self,
        _workflow: &Workflow,
        plan: &ExecutionPlan,
        run: &mut Run,
        edges: &mut [EdgeState],
        node_id: &str,
    ) {
        for &index in plan.outgoing.get(node_id).into_iter().flatten() {
            edges[index] = EdgeState::Dead;
        }
        tracing::debug!(run_id = %run.id, node_id = %node_id, "⏭️ Skipping node");
        run.set_status(node_id, NodeStatus::Skipped);
        self.publish_node(run, node_id, NodeStatus::Skipped, None, None);
    }

    fn close_open_nodes(&self, run: &mut Run) {
        let open: Vec<String> = run
            .node_status
            .iter()
            .filter(|(_, status)| !status.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        for node_id in open {
            run.set_status(&node_id, NodeStatus::Skipped);
            self.publish_node(run, &node_id, NodeStatus::Skipped, None, None);
        }
    }

    fn publish_node(
        &self,
        run: &Run,
        node_id: &str,
        status: NodeStatus,
        output: Option<Value>,
        error: Option<String>,
    ) {
        self.sink.publish(StatusEvent::Node {
            run_id: run.id.clone(),
            workflow_id: run.workflow_id.clone(),
            node_id: node_id.to_string(),
            status,
            output,
            error,
        });
    }

    fn publish_run(&self, run: &Run) {
        self.sink.publish(StatusEvent::Run {
            run_id: run.id.clone(),
            workflow_id: run.workflow_id.clone(),
            status: run.status,
            failure: run.failure.clone(),
        });
    }
}

/// Field of `output` named by the edge's source handle, or the whole output
fn select_handle(output: &Value, handle: Option<&str>) -> Value {
    match handle.and_then(|h| output.get(h)) {
        Some(field) => field.clone(),
        None => output.clone(),
    }
}
