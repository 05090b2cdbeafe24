/// Core workflow type definitions
///
/// A workflow is an immutable template: nodes (id, kind, static params) and
/// edges between their output/input handles, optionally guarded by a
/// condition. These types are serialized from JSON by the graph-definition
/// store and persisted as-is for deployments.

use crate::error::{EngineError, Result};
use crate::runtime::condition::Condition;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// Node kinds the engine itself understands as triggers
pub mod kinds {
    pub const START: &str = "start";
    pub const MANUAL_TRIGGER: &str = "manualTrigger";
    pub const CRON_TRIGGER: &str = "cronTrigger";
    pub const EVENT_TRIGGER: &str = "eventTrigger";
    pub const WEBHOOK_TRIGGER: &str = "webhookTrigger";
    pub const POLL_TRIGGER: &str = "pollTrigger";
    /// Parent node that invokes its attached sub-nodes at runtime
    pub const TOOLKIT: &str = "toolkit";
}

/// A complete workflow definition containing nodes and their connections
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workflow {
    /// Unique workflow identifier (e.g., "wf-orders")
    pub id: String,
    /// Human-readable workflow name
    #[serde(default)]
    pub name: String,
    /// Ordered node list; ids are unique within the workflow
    pub nodes: Vec<Node>,
    /// Directed connections between node handles
    #[serde(default)]
    pub edges: Vec<Edge>,
}

/// A single node in the workflow graph
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    /// Unique node identifier within the workflow (e.g., "fetch")
    pub id: String,
    /// Kind string resolved against the node registry (e.g., "httpRequest")
    pub kind: String,
    /// Static configuration parameters
    #[serde(default = "empty_object")]
    pub params: Value,
    /// Opt out of output memoization with `false`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<bool>,
    /// Per-node override of the memoization TTL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_ttl_secs: Option<u64>,
}

/// How an edge participates in data flow
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Carries the upstream output when the upstream succeeds
    #[default]
    Data,
    /// Carries the upstream error payload when the upstream fails
    Error,
}

/// Connection between two node handles
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Edge {
    /// Source node id
    pub source: String,
    /// Field of the upstream output to forward; whole output when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    /// Target node id
    pub target: String,
    /// Input key on the target; defaults to the source node id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
    /// Predicate over the upstream output; absent means pass-through
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub kind: EdgeKind,
}

/// Trigger strategies a node kind can map to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// Fired only through the programmatic/manual run surface
    Manual,
    /// Timer trigger driven by a cron schedule
    Cron,
    /// Push trigger resolved by an event dispatch
    Event,
    /// Pull trigger fed by a polling loop
    Poll,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

impl Node {
    /// Convenience constructor used by builders and tests
    pub fn new(id: impl Into<String>, kind: impl Into<String>, params: Value) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            params,
            cache: None,
            cache_ttl_secs: None,
        }
    }

    /// Trigger strategy for this node, if its kind is a trigger kind
    pub fn trigger_kind(&self) -> Option<TriggerKind> {
        match self.kind.as_str() {
            kinds::START | kinds::MANUAL_TRIGGER => Some(TriggerKind::Manual),
            kinds::CRON_TRIGGER => Some(TriggerKind::Cron),
            kinds::EVENT_TRIGGER | kinds::WEBHOOK_TRIGGER => Some(TriggerKind::Event),
            kinds::POLL_TRIGGER => Some(TriggerKind::Poll),
            _ => None,
        }
    }

    pub fn is_trigger(&self) -> bool {
        self.trigger_kind().is_some()
    }

    /// String parameter lookup
    pub fn param_str(&self, name: &str) -> Option<&str> {
        self.params.get(name).and_then(Value::as_str)
    }

    /// Unsigned integer parameter lookup
    pub fn param_u64(&self, name: &str) -> Option<u64> {
        self.params.get(name).and_then(Value::as_u64)
    }
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            source_handle: None,
            target: target.into(),
            target_handle: None,
            condition: None,
            kind: EdgeKind::Data,
        }
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn on_error(mut self) -> Self {
        self.kind = EdgeKind::Error;
        self
    }

    pub fn from_handle(mut self, handle: impl Into<String>) -> Self {
        self.source_handle = Some(handle.into());
        self
    }

    pub fn to_handle(mut self, handle: impl Into<String>) -> Self {
        self.target_handle = Some(handle.into());
        self
    }

    /// Key under which this edge's data lands in the target's inputs
    pub fn input_key(&self) -> &str {
        self.target_handle.as_deref().unwrap_or(&self.source)
    }
}

impl Workflow {
    pub fn new(id: impl Into<String>, nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            nodes,
            edges,
        }
    }

    /// Get a node by id
    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|node| node.id == node_id)
    }

    /// All trigger-kind nodes in declaration order
    pub fn trigger_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|node| node.is_trigger())
    }

    /// Enforce the structural invariants: unique node ids, edges reference
    /// existing nodes
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(self.invalid("workflow id is empty"));
        }

        let mut seen = HashSet::with_capacity(self.nodes.len());
        for node in &self.nodes {
            if node.id.is_empty() {
                return Err(self.invalid("node with empty id"));
            }
            if !seen.insert(node.id.as_str()) {
                return Err(self.invalid(format!("duplicate node id '{}'", node.id)));
            }
        }

        for edge in &self.edges {
            for endpoint in [&edge.source, &edge.target] {
                if !seen.contains(endpoint.as_str()) {
                    return Err(self.invalid(format!(
                        "edge {} -> {} references unknown node '{}'",
                        edge.source, edge.target, endpoint
                    )));
                }
            }
        }

        Ok(())
    }

    fn invalid(&self, message: impl Into<String>) -> EngineError {
        EngineError::InvalidWorkflow {
            workflow_id: self.id.clone(),
            message: message.into(),
        }
    }
}
