/// Hot-swap registry of deployed workflows using ArcSwap
///
/// Readers (trigger launchers, manual runs) take a lock-free snapshot;
/// each deploy or cancel swaps the whole map, so runs already holding an
/// `Arc<Workflow>` keep executing the definition they started with.

use crate::workflow::types::{TriggerKind, Workflow};
use arc_swap::ArcSwap;
use std::{collections::HashMap, sync::Arc};

/// Deployed workflow plus the trigger nodes extracted at deploy time
#[derive(Debug, Clone)]
pub struct CompiledWorkflow {
    pub workflow: Arc<Workflow>,
    /// `(node_id, kind)` of every trigger node, in definition order
    pub triggers: Vec<(String, TriggerKind)>,
}

impl CompiledWorkflow {
    pub fn compile(workflow: Workflow) -> Self {
        let triggers = workflow
            .trigger_nodes()
            .filter_map(|node| node.trigger_kind().map(|kind| (node.id.clone(), kind)))
            .collect();
        Self {
            workflow: Arc::new(workflow),
            triggers,
        }
    }
}

#[derive(Debug, Default)]
pub struct WorkflowRegistry {
    /// workflow_id -> compiled workflow
    workflows: ArcSwap<HashMap<String, CompiledWorkflow>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a workflow; returns the previous entry
    pub fn insert(&self, compiled: CompiledWorkflow) -> Option<CompiledWorkflow> {
        let mut previous = None;
        self.workflows.rcu(|current| {
            let mut next = (**current).clone();
            previous = next.insert(compiled.workflow.id.clone(), compiled.clone());
            next
        });
        previous
    }

    pub fn remove(&self, workflow_id: &str) -> Option<CompiledWorkflow> {
        let mut removed = None;
        self.workflows.rcu(|current| {
            let mut next = (**current).clone();
            removed = next.remove(workflow_id);
            next
        });
        if removed.is_some() {
            tracing::debug!("Removed workflow from registry: {}", workflow_id);
        }
        removed
    }

    /// Lock-free read
    pub fn get(&self, workflow_id: &str) -> Option<CompiledWorkflow> {
        self.workflows.load().get(workflow_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.workflows.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
