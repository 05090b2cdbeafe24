/// Event waiter registry.
///
/// A waiter is a single-resolution handle parked on an event type with an
/// optional filter predicate. `dispatch` resolves every matching waiter with
/// the payload and leaves the rest registered; cancellation resolves with a
/// cancellation signal instead. There is no timeout: a waiter stays pending
/// until one of those two things happens.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{EngineError, Result};
use crate::runtime::condition::Condition;

/// How a waiter was resolved
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    Event(Value),
    Cancelled,
}

/// Ownership and concurrency policy of a registration
#[derive(Debug, Clone, Default)]
pub struct WaiterScope {
    pub workflow_id: Option<String>,
    pub run_id: Option<String>,
    /// Permit several outstanding waiters for the same node
    pub allow_concurrent: bool,
}

/// Public description of a pending waiter
#[derive(Debug, Clone, Serialize)]
pub struct WaiterInfo {
    pub id: String,
    pub node_id: String,
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<Condition>,
    pub created_at: DateTime<Utc>,
}

/// Handle returned by [`EventWaiter::register`]
#[derive(Debug)]
pub struct Waiter {
    id: String,
    node_id: String,
    event_type: String,
    receiver: oneshot::Receiver<WaitOutcome>,
}

impl Waiter {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Wait for resolution. A registry dropped underneath the waiter counts
    /// as cancellation.
    pub async fn wait(self) -> WaitOutcome {
        self.receiver.await.unwrap_or(WaitOutcome::Cancelled)
    }

    /// Non-blocking check; `None` while still pending
    pub fn try_outcome(&mut self) -> Option<WaitOutcome> {
        match self.receiver.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(WaitOutcome::Cancelled),
        }
    }
}

struct Entry {
    info: WaiterInfo,
    sender: oneshot::Sender<WaitOutcome>,
}

impl Entry {
    fn resolve(self, outcome: WaitOutcome) -> bool {
        self.sender.send(outcome).is_ok()
    }
}

#[derive(Default)]
pub struct EventWaiter {
    entries: Mutex<HashMap<String, Entry>>,
}

impl EventWaiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an unscoped, exclusive waiter
    pub fn register(
        &self,
        event_type: &str,
        node_id: &str,
        filter: Option<Condition>,
    ) -> Result<Waiter> {
        self.register_scoped(event_type, node_id, filter, WaiterScope::default())
    }

    /// Register a waiter owned by a workflow and/or run.
    ///
    /// Fails with [`EngineError::WaiterConflict`] when the node (within the
    /// same workflow) already has a live waiter and the scope does not allow
    /// concurrency.
    pub fn register_scoped(
        &self,
        event_type: &str,
        node_id: &str,
        filter: Option<Condition>,
        scope: WaiterScope,
    ) -> Result<Waiter> {
        let mut entries = self.entries.lock();
        entries.retain(|_, e| !e.sender.is_closed());

        if !scope.allow_concurrent {
            let taken = entries.values().any(|e| {
                e.info.node_id == node_id && e.info.workflow_id == scope.workflow_id
            });
            if taken {
                return Err(EngineError::WaiterConflict {
                    node_id: node_id.to_string(),
                });
            }
        }

        let id = uuid::Uuid::new_v4().to_string();
        let (sender, receiver) = oneshot::channel();
        let info = WaiterInfo {
            id: id.clone(),
            node_id: node_id.to_string(),
            event_type: event_type.to_string(),
            workflow_id: scope.workflow_id,
            run_id: scope.run_id,
            filter,
            created_at: Utc::now(),
        };
        entries.insert(id.clone(), Entry { info, sender });

        tracing::debug!(waiter_id = %id, node_id = %node_id, event_type = %event_type, "⏳ Waiter registered");

        Ok(Waiter {
            id,
            node_id: node_id.to_string(),
            event_type: event_type.to_string(),
            receiver,
        })
    }

    /// Resolve every waiter on `event_type` whose filter accepts `payload`.
    /// Returns how many were resolved.
    pub fn dispatch(&self, event_type: &str, payload: &Value) -> usize {
        let matched: Vec<Entry> = {
            let mut entries = self.entries.lock();
            let ids: Vec<String> = entries
                .iter()
                .filter(|(_, e)| e.info.event_type == event_type)
                .filter(|(_, e)| e.info.filter.as_ref().is_none_or(|f| f.matches(payload)))
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| entries.remove(id)).collect()
        };

        let resolved = matched
            .into_iter()
            .map(|entry| entry.resolve(WaitOutcome::Event(payload.clone())))
            .filter(|sent| *sent)
            .count();

        tracing::info!(event_type = %event_type, resolved, "📨 Event dispatched");
        resolved
    }

    /// Cancel one waiter; false if it no longer exists
    pub fn cancel(&self, waiter_id: &str) -> bool {
        let entry = self.entries.lock().remove(waiter_id);
        match entry {
            Some(entry) => {
                tracing::debug!(waiter_id = %waiter_id, "🛑 Waiter cancelled");
                entry.resolve(WaitOutcome::Cancelled);
                true
            }
            None => false,
        }
    }

    pub fn cancel_for_node(&self, node_id: &str) -> usize {
        self.cancel_where(|info| info.node_id == node_id)
    }

    pub fn cancel_for_run(&self, run_id: &str) -> usize {
        self.cancel_where(|info| info.run_id.as_deref() == Some(run_id))
    }

    pub fn cancel_for_workflow(&self, workflow_id: &str) -> usize {
        self.cancel_where(|info| info.workflow_id.as_deref() == Some(workflow_id))
    }

    /// Cancel the trigger-owned (not run-scoped) waiters of one workflow node
    pub fn cancel_for_trigger(&self, workflow_id: &str, node_id: &str) -> usize {
        self.cancel_where(|info| {
            info.run_id.is_none() && info.node_id == node_id && info.workflow_id.as_deref() == Some(workflow_id)
        })
    }

    fn cancel_where(&self, predicate: impl Fn(&WaiterInfo) -> bool) -> usize {
        let removed: Vec<Entry> = {
            let mut entries = self.entries.lock();
            let ids: Vec<String> = entries
                .iter()
                .filter(|(_, e)| predicate(&e.info))
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| entries.remove(id)).collect()
        };

        let count = removed.len();
        for entry in removed {
            entry.resolve(WaitOutcome::Cancelled);
        }
        if count > 0 {
            tracing::info!(count, "🛑 Cancelled waiters");
        }
        count
    }

    /// Snapshot of pending waiters, oldest first
    pub fn active_waiters(&self) -> Vec<WaiterInfo> {
        let mut entries = self.entries.lock();
        entries.retain(|_, e| !e.sender.is_closed());
        let mut infos: Vec<WaiterInfo> = entries.values().map(|e| e.info.clone()).collect();
        infos.sort_by_key(|info| info.created_at);
        infos
    }

    pub fn len(&self) -> usize {
        self.active_waiters().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn filter_gates_resolution() {
        let waiters = EventWaiter::new();
        let filter = Condition::eq("status", json!("paid"));
        let mut waiter = waiters.register("order", "trigger", Some(filter)).unwrap();

        assert_eq!(waiters.dispatch("order", &json!({ "status": "pending" })), 0);
        assert_eq!(waiter.try_outcome(), None);
        assert_eq!(waiters.len(), 1);

        assert_eq!(waiters.dispatch("order", &json!({ "status": "paid" })), 1);
        assert_eq!(
            waiter.try_outcome(),
            Some(WaitOutcome::Event(json!({ "status": "paid" })))
        );
        // resolved exactly once
        assert_eq!(waiters.dispatch("order", &json!({ "status": "paid" })), 0);
    }

    #[test]
    fn other_event_types_are_ignored() {
        let waiters = EventWaiter::new();
        let mut waiter = waiters.register("a", "n", None).unwrap();
        assert_eq!(waiters.dispatch("b", &json!({})), 0);
        assert_eq!(waiter.try_outcome(), None);
    }

    #[test]
    fn one_waiter_per_node_unless_concurrent() {
        let waiters = EventWaiter::new();
        let _first = waiters.register("x", "n", None).unwrap();
        assert!(matches!(
            waiters.register("x", "n", None),
            Err(EngineError::WaiterConflict { .. })
        ));

        let concurrent = WaiterScope { allow_concurrent: true, ..WaiterScope::default() };
        assert!(waiters.register_scoped("x", "n", None, concurrent).is_ok());
    }

    #[test]
    fn dropped_handle_frees_the_node() {
        let waiters = EventWaiter::new();
        drop(waiters.register("x", "n", None).unwrap());
        assert!(waiters.register("x", "n", None).is_ok());
    }

    #[tokio::test]
    async fn cancellation_is_idempotent() {
        let waiters = EventWaiter::new();
        let waiter = waiters.register("x", "n", None).unwrap();
        let id = waiter.id().to_string();

        assert!(waiters.cancel(&id));
        assert!(!waiters.cancel(&id));
        assert_eq!(waiters.cancel_for_node("n"), 0);
        assert_eq!(waiter.wait().await, WaitOutcome::Cancelled);
    }

    #[test]
    fn scoped_cancellation() {
        let waiters = EventWaiter::new();
        let scope = |wf: &str, run: Option<&str>| WaiterScope {
            workflow_id: Some(wf.to_string()),
            run_id: run.map(str::to_string),
            allow_concurrent: true,
        };
        let _a = waiters.register_scoped("x", "n", None, scope("wf-1", Some("r1"))).unwrap();
        let _b = waiters.register_scoped("x", "n", None, scope("wf-1", None)).unwrap();
        let _c = waiters.register_scoped("x", "n", None, scope("wf-2", None)).unwrap();

        assert_eq!(waiters.cancel_for_run("r1"), 1);
        assert_eq!(waiters.cancel_for_workflow("wf-1"), 1);
        assert_eq!(waiters.active_waiters().len(), 1);
    }
}
