/// Node registry and cache-aware node invocation
///
/// Node kinds are resolved once, at startup, into a dispatch table of
/// `NodeHandler` trait objects. `NodeExecutor` is the single place a node
/// callable is invoked: it enforces the concurrency budget, honours
/// cancellation at the dispatch boundary and routes cacheable nodes through
/// the tiered cache.

use crate::cache::{cache_key, CacheOutcome, TieredCache};
use crate::error::NodeError;
use crate::runtime::condition::Condition;
use crate::trigger::waiter::{EventWaiter, WaitOutcome, WaiterScope};
use crate::workflow::types::Node;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// The contract every node kind satisfies: receive resolved parameters and
/// inputs, return a structured output or a typed failure.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn execute(&self, ctx: NodeContext) -> Result<Value, NodeError>;

    /// Whether outputs of this kind may be memoized
    fn cacheable(&self) -> bool {
        true
    }
}

/// Adapter turning an async closure into a handler
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> NodeHandler for FnHandler<F>
where
    F: Fn(NodeContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, NodeError>> + Send,
{
    async fn execute(&self, ctx: NodeContext) -> Result<Value, NodeError> {
        (self.f)(ctx).await
    }
}

/// Dispatch table: kind string -> handler
#[derive(Default, Clone)]
pub struct NodeRegistry {
    handlers: HashMap<String, Arc<dyn NodeHandler>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: impl Into<String>, handler: Arc<dyn NodeHandler>) -> &mut Self {
        self.handlers.insert(kind.into(), handler);
        self
    }

    /// Register a cacheable closure handler
    pub fn register_fn<F, Fut>(&mut self, kind: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(NodeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, NodeError>> + Send + 'static,
    {
        self.register(kind, Arc::new(FnHandler { f }))
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn NodeHandler>> {
        self.handlers.get(kind).cloned()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

/// Identity of the run a node invocation belongs to
#[derive(Debug, Clone)]
pub struct RunScope {
    pub run_id: String,
    pub workflow_id: String,
    pub cancel: CancellationToken,
}

/// Everything a node callable may see or do
#[derive(Clone)]
pub struct NodeContext {
    scope: RunScope,
    node: Node,
    inputs: Map<String, Value>,
    sub_nodes: Vec<Node>,
    executor: Arc<NodeExecutor>,
}

impl NodeContext {
    pub fn run_id(&self) -> &str {
        &self.scope.run_id
    }

    pub fn workflow_id(&self) -> &str {
        &self.scope.workflow_id
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn params(&self) -> &Value {
        &self.node.params
    }

    /// Inputs keyed by edge target handle (or source node id)
    pub fn inputs(&self) -> &Map<String, Value> {
        &self.inputs
    }

    pub fn input(&self, key: &str) -> Option<&Value> {
        self.inputs.get(key)
    }

    /// The lone input when exactly one edge delivered data, else the whole map
    pub fn merged_input(&self) -> Value {
        if self.inputs.len() == 1 {
            if let Some(value) = self.inputs.values().next() {
                return value.clone();
            }
        }
        Value::Object(self.inputs.clone())
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.scope.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.scope.cancel.is_cancelled()
    }

    /// Aggregator sub-nodes attached to this node
    pub fn sub_nodes(&self) -> &[Node] {
        &self.sub_nodes
    }

    /// Park until an event of `event_type` passing `filter` is dispatched.
    ///
    /// The waiter is scoped to this run, so recovery and run cancellation
    /// release it.
    pub async fn wait_for_event(
        &self,
        event_type: &str,
        filter: Option<Condition>,
    ) -> Result<Value, NodeError> {
        let scope = WaiterScope {
            workflow_id: Some(self.scope.workflow_id.clone()),
            run_id: Some(self.scope.run_id.clone()),
            allow_concurrent: true,
        };
        let waiter = self
            .executor
            .waiters
            .register_scoped(event_type, &self.node.id, filter, scope)
            .map_err(|e| NodeError::failed(e.to_string()))?;
        let waiter_id = waiter.id().to_string();

        tokio::select! {
            outcome = waiter.wait() => match outcome {
                WaitOutcome::Event(payload) => Ok(payload),
                WaitOutcome::Cancelled => Err(NodeError::Cancelled),
            },
            _ = self.scope.cancel.cancelled() => {
                self.executor.waiters.cancel(&waiter_id);
                Err(NodeError::Cancelled)
            }
        }
    }

    /// Synchronously invoke one of this node's aggregator sub-nodes.
    ///
    /// The sub-node receives `input` keyed by this node's id and runs inside
    /// the caller's concurrency permit.
    pub async fn invoke_sub_node(&self, node_id: &str, input: Value) -> Result<Value, NodeError> {
        let sub = self
            .sub_nodes
            .iter()
            .find(|n| n.id == node_id)
            .ok_or_else(|| NodeError::failed(format!("'{}' is not a sub-node of '{}'", node_id, self.node.id)))?;

        let mut inputs = Map::new();
        inputs.insert(self.node.id.clone(), input);

        tracing::debug!(run_id = %self.scope.run_id, parent = %self.node.id, node_id = %node_id, "🧩 Invoking sub-node");
        self.executor
            .invoke_inner(&self.scope, sub, inputs, Vec::new(), false)
            .await
            .map(|(value, _)| value)
    }
}

/// Invokes node callables for every run of the process
pub struct NodeExecutor {
    registry: NodeRegistry,
    cache: Arc<TieredCache>,
    waiters: Arc<EventWaiter>,
    budget: Arc<Semaphore>,
}

impl NodeExecutor {
    pub fn new(
        registry: NodeRegistry,
        cache: Arc<TieredCache>,
        waiters: Arc<EventWaiter>,
        max_concurrency: usize,
    ) -> Self {
        Self {
            registry,
            cache,
            waiters,
            budget: Arc::new(Semaphore::new(max_concurrency.max(1))),
        }
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    pub fn waiters(&self) -> &Arc<EventWaiter> {
        &self.waiters
    }

    /// Invoke `node` for a run, consulting the cache first when allowed
    pub async fn invoke(
        self: &Arc<Self>,
        scope: &RunScope,
        node: &Node,
        inputs: Map<String, Value>,
        sub_nodes: Vec<Node>,
    ) -> Result<(Value, CacheOutcome), NodeError> {
        self.invoke_inner(scope, node, inputs, sub_nodes, true).await
    }

    async fn invoke_inner(
        self: &Arc<Self>,
        scope: &RunScope,
        node: &Node,
        inputs: Map<String, Value>,
        sub_nodes: Vec<Node>,
        bounded: bool,
    ) -> Result<(Value, CacheOutcome), NodeError> {
        let handler = self
            .registry
            .get(&node.kind)
            .ok_or_else(|| NodeError::UnknownKind(node.kind.clone()))?;

        if scope.cancel.is_cancelled() {
            return Err(NodeError::Cancelled);
        }

        let _permit = if bounded {
            let permit = tokio::select! {
                permit = Arc::clone(&self.budget).acquire_owned() => permit
                    .map_err(|_| NodeError::failed("executor is shutting down"))?,
                _ = scope.cancel.cancelled() => return Err(NodeError::Cancelled),
            };
            Some(permit)
        } else {
            None
        };

        let use_cache = handler.cacheable() && node.cache != Some(false);
        let key = use_cache.then(|| cache_key(&node.kind, &node.params, &Value::Object(inputs.clone())));

        let ctx = NodeContext {
            scope: scope.clone(),
            node: node.clone(),
            inputs,
            sub_nodes,
            executor: Arc::clone(self),
        };

        let Some(key) = key else {
            return handler.execute(ctx).await.map(|v| (v, CacheOutcome::Uncached));
        };

        let ttl = node
            .cache_ttl_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.cache.config().default_ttl());

        let (value, outcome) = self
            .cache
            .get_or_compute(&key, ttl, || handler.execute(ctx))
            .await?;

        if matches!(outcome, CacheOutcome::Hit | CacheOutcome::Waited) {
            tracing::info!(run_id = %scope.run_id, node_id = %node.id, "♻️ Reused cached output ({:?})", outcome);
        }
        Ok((value, outcome))
    }
}
