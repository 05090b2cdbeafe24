/// Run state and the process-wide run registry
///
/// A `Run` is owned by the scheduler task driving it. Everything outside
/// that task sees runs only through `RunRecord` snapshots published to the
/// `RunRegistry`, keyed by run id, each carrying its own cancellation token.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Ready,
    Running,
    Success,
    Error,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Skipped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Error,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// An unhandled node error
    NodeFailed,
    /// Declared orphaned by the reaper
    Crashed,
    Cancelled,
    /// Planning rejected the workflow
    Invalid,
}

/// Why a run ended in `error` or `cancelled`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub message: String,
    pub reason: FailureReason,
}

impl RunFailure {
    pub fn node(node_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            node_id: Some(node_id.into()),
            message: message.into(),
            reason: FailureReason::NodeFailed,
        }
    }

    pub fn crashed(message: impl Into<String>) -> Self {
        Self {
            node_id: None,
            message: message.into(),
            reason: FailureReason::Crashed,
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            node_id: None,
            message: message.into(),
            reason: FailureReason::Cancelled,
        }
    }
}

/// Mutable execution context of one run
#[derive(Debug)]
pub struct Run {
    pub id: String,
    pub workflow_id: String,
    pub trigger_node: Option<String>,
    pub trigger_payload: Value,
    pub status: RunStatus,
    pub node_status: HashMap<String, NodeStatus>,
    pub outputs: HashMap<String, Value>,
    pub errors: HashMap<String, String>,
    pub failure: Option<RunFailure>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancel: CancellationToken,
}

impl Run {
    pub fn new(
        workflow_id: impl Into<String>,
        trigger_node: Option<String>,
        trigger_payload: Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: workflow_id.into(),
            trigger_node,
            trigger_payload,
            status: RunStatus::Pending,
            node_status: HashMap::new(),
            outputs: HashMap::new(),
            errors: HashMap::new(),
            failure: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn status_of(&self, node_id: &str) -> Option<NodeStatus> {
        self.node_status.get(node_id).copied()
    }

    pub fn set_status(&mut self, node_id: &str, status: NodeStatus) {
        self.node_status.insert(node_id.to_string(), status);
    }

    pub fn snapshot(&self) -> RunRecord {
        RunRecord {
            run_id: self.id.clone(),
            workflow_id: self.workflow_id.clone(),
            trigger_node: self.trigger_node.clone(),
            status: self.status,
            node_status: self.node_status.clone(),
            outputs: self.outputs.clone(),
            failure: self.failure.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

/// Read-only view of a run published to the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub workflow_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_node: Option<String>,
    pub status: RunStatus,
    pub node_status: HashMap<String, NodeStatus>,
    pub outputs: HashMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

struct Entry {
    record: RunRecord,
    cancel: CancellationToken,
}

/// Map of run id -> latest snapshot plus the run's cancellation token.
///
/// Once a record is terminal it is never overwritten.
#[derive(Default)]
pub struct RunRegistry {
    runs: RwLock<HashMap<String, Entry>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, run: &Run) {
        self.runs.write().insert(
            run.id.clone(),
            Entry {
                record: run.snapshot(),
                cancel: run.cancel.clone(),
            },
        );
    }

    /// Publish a newer snapshot; returns false if the stored record is
    /// already terminal
    pub fn update(&self, record: RunRecord) -> bool {
        let mut runs = self.runs.write();
        match runs.get_mut(&record.run_id) {
            Some(entry) if entry.record.status.is_terminal() => false,
            Some(entry) => {
                entry.record = record;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, run_id: &str) -> Option<RunRecord> {
        self.runs.read().get(run_id).map(|e| e.record.clone())
    }

    pub fn cancel_token(&self, run_id: &str) -> Option<CancellationToken> {
        self.runs.read().get(run_id).map(|e| e.cancel.clone())
    }

    pub fn non_terminal(&self) -> Vec<RunRecord> {
        self.runs
            .read()
            .values()
            .filter(|e| !e.record.status.is_terminal())
            .map(|e| e.record.clone())
            .collect()
    }

    pub fn by_workflow(&self, workflow_id: &str) -> Vec<RunRecord> {
        let mut records: Vec<RunRecord> = self
            .runs
            .read()
            .values()
            .filter(|e| e.record.workflow_id == workflow_id)
            .map(|e| e.record.clone())
            .collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    /// Force a non-terminal run to `error` with reason `crashed` and fire its
    /// cancellation token. Returns the new record, or None if the run is
    /// unknown or already terminal.
    pub fn force_crashed(&self, run_id: &str, message: &str) -> Option<RunRecord> {
        let mut runs = self.runs.write();
        let entry = runs.get_mut(run_id)?;
        if entry.record.status.is_terminal() {
            return None;
        }
        entry.record.status = RunStatus::Error;
        entry.record.failure = Some(RunFailure::crashed(message));
        entry.record.completed_at = Some(Utc::now());
        entry.cancel.cancel();
        Some(entry.record.clone())
    }

    /// Drop terminal records that completed more than `max_age` ago
    pub fn prune_terminal(&self, max_age: chrono::Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let mut runs = self.runs.write();
        let before = runs.len();
        runs.retain(|_, e| {
            !(e.record.status.is_terminal() && e.record.completed_at.is_some_and(|at| at < cutoff))
        });
        before - runs.len()
    }

    pub fn len(&self) -> usize {
        self.runs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
