/// Pull triggers for APIs without push capability.
///
/// A poll trigger runs two tasks: a producer that calls its `PollSource` on a
/// fixed interval and enqueues items it has not seen before onto a bounded
/// queue, and a consumer that drains that queue one item at a time, launching
/// a run per item.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, NodeError, Result};
use crate::runtime::engine::TriggerFiring;
use crate::trigger::RunLauncher;
use crate::workflow::types::Node;

/// External poll function: returns the items currently visible upstream
#[async_trait]
pub trait PollSource: Send + Sync {
    async fn poll(&self, node: &Node) -> std::result::Result<Vec<Value>, NodeError>;
}

/// Poll sources keyed by the `source` parameter of a `pollTrigger`
#[derive(Clone, Default)]
pub struct PollSources {
    sources: HashMap<String, Arc<dyn PollSource>>,
}

impl PollSources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `http` source
    pub fn with_builtins() -> Self {
        let mut sources = Self::new();
        sources.register("http", Arc::new(HttpPollSource::new()));
        sources
    }

    pub fn register(&mut self, name: impl Into<String>, source: Arc<dyn PollSource>) -> &mut Self {
        self.sources.insert(name.into(), source);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn PollSource>> {
        self.sources.get(name).cloned()
    }
}

/// GETs `url` and accepts either a JSON array or an object with `items`
pub struct HttpPollSource {
    client: reqwest::Client,
}

impl HttpPollSource {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpPollSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PollSource for HttpPollSource {
    async fn poll(&self, node: &Node) -> std::result::Result<Vec<Value>, NodeError> {
        let url = node
            .param_str("url")
            .ok_or_else(|| NodeError::invalid_param("url", "missing"))?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| NodeError::failed(format!("poll request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(NodeError::failed(format!("poll of {} returned {}", url, response.status())));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| NodeError::failed(format!("poll response is not JSON: {}", e)))?;

        extract_items(body)
    }
}

fn extract_items(body: Value) -> std::result::Result<Vec<Value>, NodeError> {
    match body {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => match map.remove("items") {
            Some(Value::Array(items)) => Ok(items),
            _ => Err(NodeError::failed("poll response has no 'items' array")),
        },
        other => Err(NodeError::failed(format!("unexpected poll response: {}", other))),
    }
}

/// Parsed `pollTrigger` parameters
#[derive(Debug, Clone)]
pub struct PollTrigger {
    pub workflow_id: String,
    pub node: Node,
    pub source: String,
    pub interval: Duration,
    pub id_field: String,
    pub queue_capacity: usize,
}

impl PollTrigger {
    /// Params: `source` (default `http`), `interval_secs`, `id_field` (default `id`)
    pub fn from_node(workflow_id: &str, node: &Node, default_interval: Duration, queue_capacity: usize) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            node: node.clone(),
            source: node.param_str("source").unwrap_or("http").to_string(),
            interval: node
                .param_u64("interval_secs")
                .map(Duration::from_secs)
                .unwrap_or(default_interval)
                .max(Duration::from_millis(1)),
            id_field: node.param_str("id_field").unwrap_or("id").to_string(),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Resolve the configured source
    pub fn source(&self, sources: &PollSources) -> Result<Arc<dyn PollSource>> {
        sources.get(&self.source).ok_or_else(|| EngineError::TriggerConfig {
            node_id: self.node.id.clone(),
            message: format!("unknown poll source '{}'", self.source),
        })
    }

    /// Spawn the producer and consumer; both stop when `stop` fires.
    pub fn arm(
        self,
        sources: &PollSources,
        launcher: Arc<dyn RunLauncher>,
        stop: CancellationToken,
    ) -> Result<(JoinHandle<()>, JoinHandle<()>)> {
        let source = self.source(sources)?;

        let (tx, rx) = mpsc::channel(self.queue_capacity);
        tracing::info!(
            workflow_id = %self.workflow_id,
            node_id = %self.node.id,
            "🔁 Poll trigger armed: source '{}' every {:?}",
            self.source,
            self.interval
        );

        let node_id = self.node.id.clone();
        let producer = tokio::spawn(self.produce(source, tx, stop.clone()));
        let consumer = tokio::spawn(consume(node_id, rx, launcher, stop));
        Ok((producer, consumer))
    }

    async fn produce(self, source: Arc<dyn PollSource>, tx: mpsc::Sender<Value>, stop: CancellationToken) {
        let mut seen: HashSet<String> = HashSet::new();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let items = match source.poll(&self.node).await {
                Ok(items) => items,
                Err(e) => {
                    tracing::warn!(node_id = %self.node.id, error = %e, "⚠️ Poll failed");
                    continue;
                }
            };

            let fresh: Vec<Value> = items
                .into_iter()
                .filter(|item| seen.insert(item_identity(item, &self.id_field)))
                .collect();
            if !fresh.is_empty() {
                tracing::debug!(node_id = %self.node.id, count = fresh.len(), "📥 Poll found new items");
            }

            for item in fresh {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    sent = tx.send(item) => if sent.is_err() { return },
                }
            }
        }
    }
}

async fn consume(
    node_id: String,
    mut rx: mpsc::Receiver<Value>,
    launcher: Arc<dyn RunLauncher>,
    stop: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            _ = stop.cancelled() => break,
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        match launcher.launch(TriggerFiring::from_node(&node_id, item)) {
            Ok(run_id) => tracing::info!(node_id = %node_id, run_id = %run_id, "🔔 Poll trigger fired"),
            Err(e) => tracing::error!(node_id = %node_id, error = %e, "❌ Poll trigger could not start run"),
        }
    }
    tracing::debug!(node_id = %node_id, "⏹️ Poll consumer stopped");
}

/// Dedup identity: the id field when present, else the canonical JSON
fn item_identity(item: &Value, id_field: &str) -> String {
    match item.get(id_field) {
        Some(Value::String(id)) => id.clone(),
        Some(id) => id.to_string(),
        None => item.to_string(),
    }
}
