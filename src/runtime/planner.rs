/// Graph planner
///
/// Turns a workflow template into a per-run schedule: topological order,
/// unresolved dependency counts, the nodes each node unblocks, and the edge
/// indices the scheduler resolves. Aggregator sub-nodes (nodes whose every
/// outgoing edge targets a toolkit node) are pulled out of the schedule and
/// attached to their toolkit instead.

use crate::error::{EngineError, Result};
use crate::workflow::types::{kinds, Workflow};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};

/// Per-run schedule derived from a workflow
#[derive(Debug, Clone, Default)]
pub struct ExecutionPlan {
    /// Scheduled node ids in a valid topological order
    pub order: Vec<String>,
    /// Unresolved dependency count per scheduled node
    pub dependencies: HashMap<String, usize>,
    /// Scheduled node id -> scheduled nodes it feeds
    pub unblocks: HashMap<String, Vec<String>>,
    /// Scheduled node id -> indices into `workflow.edges` arriving at it
    pub incoming: HashMap<String, Vec<usize>>,
    /// Scheduled node id -> indices into `workflow.edges` leaving it
    pub outgoing: HashMap<String, Vec<usize>>,
    /// Toolkit node id -> aggregator sub-nodes it invokes
    pub sub_nodes: HashMap<String, Vec<String>>,
    /// Trigger-kind node ids among the scheduled nodes
    pub triggers: Vec<String>,
}

impl ExecutionPlan {
    pub fn is_scheduled(&self, node_id: &str) -> bool {
        self.dependencies.contains_key(node_id)
    }

    pub fn is_sub_node(&self, node_id: &str) -> bool {
        self.sub_nodes.values().any(|subs| subs.iter().any(|s| s == node_id))
    }

    /// Nodes with no unresolved dependencies
    pub fn roots(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| self.dependencies.get(*id) == Some(&0))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct GraphPlanner {
    toolkit_kinds: HashSet<String>,
}

impl Default for GraphPlanner {
    fn default() -> Self {
        Self::new([kinds::TOOLKIT])
    }
}

impl GraphPlanner {
    /// Planner treating every listed kind as a toolkit parent
    pub fn new<I, S>(toolkit_kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            toolkit_kinds: toolkit_kinds.into_iter().map(Into::into).collect(),
        }
    }

    /// Validate, order and schedule a workflow for a fresh run
    pub fn plan(&self, workflow: &Workflow) -> Result<ExecutionPlan> {
        workflow.validate()?;

        let order = self.topological_order(workflow)?;
        let sub_nodes = self.find_sub_nodes(workflow);
        let excluded: HashSet<&str> = sub_nodes
            .values()
            .flatten()
            .map(String::as_str)
            .collect();

        let mut plan = ExecutionPlan {
            sub_nodes: sub_nodes.clone(),
            ..ExecutionPlan::default()
        };

        for id in order {
            if excluded.contains(id.as_str()) {
                continue;
            }
            if workflow.node(&id).is_some_and(|n| n.is_trigger()) {
                plan.triggers.push(id.clone());
            }
            plan.dependencies.insert(id.clone(), 0);
            plan.incoming.insert(id.clone(), Vec::new());
            plan.outgoing.insert(id.clone(), Vec::new());
            plan.unblocks.insert(id.clone(), Vec::new());
            plan.order.push(id);
        }

        for (index, edge) in workflow.edges.iter().enumerate() {
            if excluded.contains(edge.source.as_str()) || excluded.contains(edge.target.as_str()) {
                continue;
            }

            if let Some(out) = plan.outgoing.get_mut(&edge.source) {
                out.push(index);
            }
            if let Some(inc) = plan.incoming.get_mut(&edge.target) {
                inc.push(index);
            }

            if let Some(unblocks) = plan.unblocks.get_mut(&edge.source) {
                if !unblocks.contains(&edge.target) {
                    unblocks.push(edge.target.clone());
                }
            }
            if let Some(count) = plan.dependencies.get_mut(&edge.target) {
                *count += 1;
            }
        }

        tracing::debug!(
            workflow_id = %workflow.id,
            scheduled = plan.order.len(),
            sub_nodes = excluded.len(),
            "📋 Planned execution"
        );

        Ok(plan)
    }

    fn topological_order(&self, workflow: &Workflow) -> Result<Vec<String>> {
        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let mut index_of: HashMap<&str, NodeIndex> = HashMap::new();

        for node in &workflow.nodes {
            index_of.insert(node.id.as_str(), graph.add_node(node.id.as_str()));
        }
        for edge in &workflow.edges {
            if let (Some(&from), Some(&to)) = (
                index_of.get(edge.source.as_str()),
                index_of.get(edge.target.as_str()),
            ) {
                graph.update_edge(from, to, ());
            }
        }

        let sorted = toposort(&graph, None).map_err(|cycle| EngineError::CyclicGraph {
            workflow_id: workflow.id.clone(),
            node_id: graph[cycle.node_id()].to_string(),
        })?;

        Ok(sorted.into_iter().map(|idx| graph[idx].to_string()).collect())
    }

    /// Toolkit id -> nodes whose outgoing edges all target that toolkit kind
    fn find_sub_nodes(&self, workflow: &Workflow) -> HashMap<String, Vec<String>> {
        let is_toolkit = |id: &str| {
            workflow
                .node(id)
                .is_some_and(|n| self.toolkit_kinds.contains(&n.kind))
        };

        let mut sub_nodes: HashMap<String, Vec<String>> = HashMap::new();
        for node in &workflow.nodes {
            if node.is_trigger() || self.toolkit_kinds.contains(&node.kind) {
                continue;
            }
            let targets: Vec<&str> = workflow
                .edges
                .iter()
                .filter(|e| e.source == node.id)
                .map(|e| e.target.as_str())
                .collect();
            if targets.is_empty() || !targets.iter().all(|t| is_toolkit(t)) {
                continue;
            }
            for toolkit in targets {
                let entry = sub_nodes.entry(toolkit.to_string()).or_default();
                if !entry.contains(&node.id) {
                    entry.push(node.id.clone());
                }
            }
        }
        sub_nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::{Edge, Node};
    use serde_json::json;

    fn node(id: &str, kind: &str) -> Node {
        Node::new(id, kind, json!({}))
    }

    #[test]
    fn computes_dependencies_and_unblocks() {
        let workflow = Workflow::new(
            "wf",
            vec![node("start", "start"), node("a", "noOp"), node("b", "noOp"), node("join", "noOp")],
            vec![
                Edge::new("start", "a"),
                Edge::new("start", "b"),
                Edge::new("a", "join"),
                Edge::new("b", "join"),
            ],
        );

        let plan = GraphPlanner::default().plan(&workflow).unwrap();
        assert_eq!(plan.dependencies["start"], 0);
        assert_eq!(plan.dependencies["join"], 2);
        assert_eq!(plan.unblocks["start"].len(), 2);
        assert_eq!(plan.triggers, vec!["start".to_string()]);
        assert_eq!(plan.unblocks["a"], vec!["join".to_string()]);
        assert_eq!(plan.incoming["join"].len(), 2);
    }

    #[test]
    fn rejects_cycles() {
        let workflow = Workflow::new(
            "wf",
            vec![node("a", "noOp"), node("b", "noOp")],
            vec![Edge::new("a", "b"), Edge::new("b", "a")],
        );
        let err = GraphPlanner::default().plan(&workflow).unwrap_err();
        assert!(matches!(err, EngineError::CyclicGraph { .. }));
    }

    #[test]
    fn excludes_aggregator_sub_nodes_from_schedule() {
        let workflow = Workflow::new(
            "wf",
            vec![
                node("start", "start"),
                node("agent", "toolkit"),
                node("search", "httpRequest"),
                node("calc", "noOp"),
                node("after", "noOp"),
            ],
            vec![
                Edge::new("start", "agent"),
                Edge::new("search", "agent"),
                Edge::new("calc", "agent"),
                Edge::new("agent", "after"),
            ],
        );

        let plan = GraphPlanner::default().plan(&workflow).unwrap();
        assert!(!plan.is_scheduled("search"));
        assert!(!plan.is_scheduled("calc"));
        assert!(plan.is_sub_node("search"));
        assert_eq!(plan.sub_nodes["agent"], vec!["search".to_string(), "calc".to_string()]);
        // only the trigger edge counts for the toolkit
        assert_eq!(plan.dependencies["agent"], 1);
        assert_eq!(plan.roots(), vec!["start".to_string()]);
    }
}
