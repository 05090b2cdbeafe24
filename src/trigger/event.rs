/// Push (event) trigger
///
/// Keeps exactly one waiter parked for the trigger node. On each resolution
/// it spawns a fresh run with the event payload and immediately parks a new
/// waiter, so firings never queue behind a run that is still executing.

use crate::error::{EngineError, Result};
use crate::runtime::condition::Condition;
use crate::runtime::engine::TriggerFiring;
use crate::trigger::waiter::{EventWaiter, WaitOutcome, Waiter, WaiterScope};
use crate::trigger::RunLauncher;
use crate::workflow::types::Node;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Parsed `eventTrigger`/`webhookTrigger` parameters
#[derive(Debug, Clone)]
pub struct EventTrigger {
    pub workflow_id: String,
    pub node_id: String,
    pub event_type: String,
    pub filter: Option<Condition>,
    pub allow_concurrent: bool,
}

impl EventTrigger {
    /// Params: `event_type` (defaults to the node id), `filter`, `allow_concurrent`
    pub fn from_node(workflow_id: &str, node: &Node) -> Result<Self> {
        let filter = match node.params.get("filter") {
            Some(raw) if !raw.is_null() => Some(serde_json::from_value(raw.clone()).map_err(|e| {
                EngineError::TriggerConfig {
                    node_id: node.id.clone(),
                    message: format!("invalid filter: {}", e),
                }
            })?),
            _ => None,
        };

        Ok(Self {
            workflow_id: workflow_id.to_string(),
            node_id: node.id.clone(),
            event_type: node.param_str("event_type").unwrap_or(node.id.as_str()).to_string(),
            filter,
            allow_concurrent: node
                .params
                .get("allow_concurrent")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        })
    }

    fn register(&self, waiters: &EventWaiter) -> Result<Waiter> {
        let scope = WaiterScope {
            workflow_id: Some(self.workflow_id.clone()),
            run_id: None,
            allow_concurrent: self.allow_concurrent,
        };
        waiters.register_scoped(&self.event_type, &self.node_id, self.filter.clone(), scope)
    }

    /// Park the first waiter now (surfacing conflicts to the caller), then
    /// loop in the background until `stop` fires or the waiter is cancelled.
    pub fn arm(
        self,
        waiters: Arc<EventWaiter>,
        launcher: Arc<dyn RunLauncher>,
        stop: CancellationToken,
    ) -> Result<JoinHandle<()>> {
        let first = self.register(&waiters)?;
        tracing::info!(
            workflow_id = %self.workflow_id,
            node_id = %self.node_id,
            "📡 Event trigger armed on '{}'",
            self.event_type
        );

        Ok(tokio::spawn(async move {
            let mut waiter = first;
            loop {
                let waiter_id = waiter.id().to_string();
                let outcome = tokio::select! {
                    outcome = waiter.wait() => outcome,
                    _ = stop.cancelled() => {
                        waiters.cancel(&waiter_id);
                        break;
                    }
                };

                let payload = match outcome {
                    WaitOutcome::Event(payload) => payload,
                    WaitOutcome::Cancelled => {
                        tracing::info!(node_id = %self.node_id, "🛑 Event trigger waiter cancelled");
                        break;
                    }
                };

                match launcher.launch(TriggerFiring::from_node(&self.node_id, payload)) {
                    Ok(run_id) => tracing::info!(
                        workflow_id = %self.workflow_id,
                        node_id = %self.node_id,
                        run_id = %run_id,
                        "🔔 Event trigger fired"
                    ),
                    Err(e) => tracing::error!(node_id = %self.node_id, error = %e, "❌ Failed to start run"),
                }

                if stop.is_cancelled() {
                    break;
                }
                waiter = match self.register(&waiters) {
                    Ok(next) => next,
                    Err(e) => {
                        tracing::error!(node_id = %self.node_id, error = %e, "❌ Could not re-arm event trigger");
                        break;
                    }
                };
            }
            tracing::debug!(node_id = %self.node_id, "⏹️ Event trigger loop ended");
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    #[derive(Default)]
    struct Recorder {
        fired: Mutex<Vec<Value>>,
    }

    impl RunLauncher for Recorder {
        fn launch(&self, firing: TriggerFiring) -> Result<String> {
            self.fired.lock().push(firing.payload);
            Ok("run".into())
        }
    }

    #[tokio::test]
    async fn fires_once_per_matching_event_and_rearms() {
        let waiters = Arc::new(EventWaiter::new());
        let recorder = Arc::new(Recorder::default());
        let node = Node::new(
            "hook",
            "eventTrigger",
            json!({ "event_type": "order", "filter": { "op": "eq", "field": "paid", "value": true } }),
        );
        let stop = CancellationToken::new();
        let task = EventTrigger::from_node("wf", &node)
            .unwrap()
            .arm(waiters.clone(), recorder.clone(), stop.clone())
            .unwrap();

        assert_eq!(waiters.dispatch("order", &json!({ "paid": false })), 0);
        assert_eq!(waiters.dispatch("order", &json!({ "paid": true, "n": 1 })), 1);

        // wait for the loop to re-arm
        for _ in 0..100 {
            if waiters.len() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(waiters.dispatch("order", &json!({ "paid": true, "n": 2 })), 1);

        stop.cancel();
        task.await.unwrap();
        assert!(waiters.is_empty());
        assert_eq!(recorder.fired.lock().len(), 2);
    }

    #[test]
    fn rejects_malformed_filter() {
        let node = Node::new("hook", "eventTrigger", json!({ "filter": { "op": "bogus" } }));
        assert!(matches!(
            EventTrigger::from_node("wf", &node),
            Err(EngineError::TriggerConfig { .. })
        ));
    }
}
