/// Status events pushed to the external broadcaster
///
/// The engine reports every node and run transition through a `StatusSink`;
/// fan-out to UIs or observability is the sink's business.

use crate::runtime::run::{NodeStatus, RunFailure, RunStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusEvent {
    /// `{run_id, node_id, status, output?}`
    Node {
        run_id: String,
        workflow_id: String,
        node_id: String,
        status: NodeStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// `{run_id, status}`; terminal failures carry the failing node and message
    Run {
        run_id: String,
        workflow_id: String,
        status: RunStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        failure: Option<RunFailure>,
    },
}

impl StatusEvent {
    pub fn run_id(&self) -> &str {
        match self {
            Self::Node { run_id, .. } | Self::Run { run_id, .. } => run_id,
        }
    }
}

pub trait StatusSink: Send + Sync {
    fn publish(&self, event: StatusEvent);
}

/// Discards everything
#[derive(Debug, Clone, Default)]
pub struct NoopSink;

impl StatusSink for NoopSink {
    fn publish(&self, _event: StatusEvent) {}
}

/// Forwards events to an unbounded channel so a slow consumer never stalls
/// the scheduler
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<StatusEvent>,
}

impl ChannelSink {
    pub fn new(sender: mpsc::UnboundedSender<StatusEvent>) -> Self {
        Self { sender }
    }

    /// Sink plus the receiving end
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<StatusEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::new(sender), receiver)
    }
}

impl StatusSink for ChannelSink {
    fn publish(&self, event: StatusEvent) {
        // receiver may be gone
        let _ = self.sender.send(event);
    }
}

/// Fans every event out to any number of live subscribers (the SSE route,
/// in-process observers). Events published while nobody listens are only
/// logged; a subscriber that lags behind loses the oldest events.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    sender: broadcast::Sender<StatusEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl StatusSink for BroadcastSink {
    fn publish(&self, event: StatusEvent) {
        match &event {
            StatusEvent::Node { run_id, node_id, status, .. } => {
                tracing::debug!(run_id = %run_id, node_id = %node_id, status = ?status, "📣 Node status")
            }
            StatusEvent::Run { run_id, status, .. } => {
                tracing::debug!(run_id = %run_id, status = ?status, "📣 Run status")
            }
        }
        // Err only means no subscriber right now
        let _ = self.sender.send(event);
    }
}
