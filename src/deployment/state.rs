/// Per-workflow deployment state
///
/// Holds what was armed for each trigger node and how to disarm it, plus the
/// serializable status view returned by `get_status(workflow_id)`.

use crate::trigger::Teardown;
use crate::workflow::types::TriggerKind;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct ArmedTrigger {
    pub node_id: String,
    pub kind: TriggerKind,
    pub teardown: Teardown,
}

#[derive(Debug, Clone)]
pub struct DeploymentState {
    pub workflow_id: String,
    pub name: String,
    pub triggers: Vec<ArmedTrigger>,
    pub deployed_at: DateTime<Utc>,
}

impl DeploymentState {
    pub fn new(workflow_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            name: name.into(),
            triggers: Vec::new(),
            deployed_at: Utc::now(),
        }
    }

    pub fn status(&self, active_runs: Vec<String>) -> DeploymentStatus {
        DeploymentStatus {
            workflow_id: self.workflow_id.clone(),
            name: self.name.clone(),
            deployed_at: self.deployed_at,
            triggers: self
                .triggers
                .iter()
                .map(|t| TriggerStatus {
                    node_id: t.node_id.clone(),
                    kind: t.kind,
                    armed: !matches!(t.teardown, Teardown::None),
                })
                .collect(),
            active_runs,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TriggerStatus {
    pub node_id: String,
    pub kind: TriggerKind,
    /// False for manual triggers, which only fire through `run_now`
    pub armed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeploymentStatus {
    pub workflow_id: String,
    pub name: String,
    pub deployed_at: DateTime<Utc>,
    pub triggers: Vec<TriggerStatus>,
    /// Non-terminal runs of this workflow
    pub active_runs: Vec<String>,
}
