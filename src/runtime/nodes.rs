/// Built-in generic node kinds
///
/// The catalog of provider-specific nodes lives outside the engine; these are
/// the handful of generic kinds every deployment gets:
/// - noOp: passes its input through
/// - set: emits the static `values` parameter
/// - httpRequest: calls an HTTP endpoint with reqwest
/// - waitForEvent: parks the run until a matching event is dispatched
/// - toolkit: invokes each attached aggregator sub-node

use crate::error::NodeError;
use crate::runtime::condition::Condition;
use crate::runtime::executor::{NodeContext, NodeHandler, NodeRegistry};
use crate::workflow::types::kinds;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

pub const NO_OP: &str = "noOp";
pub const SET: &str = "set";
pub const HTTP_REQUEST: &str = "httpRequest";
pub const WAIT_FOR_EVENT: &str = "waitForEvent";

/// Registry preloaded with the built-in kinds
pub fn builtin_registry() -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    registry
        .register(NO_OP, Arc::new(NoOpNode))
        .register(SET, Arc::new(SetNode))
        .register(HTTP_REQUEST, Arc::new(HttpRequestNode::new()))
        .register(WAIT_FOR_EVENT, Arc::new(WaitForEventNode))
        .register(kinds::TOOLKIT, Arc::new(ToolkitNode));
    registry
}

pub struct NoOpNode;

#[async_trait]
impl NodeHandler for NoOpNode {
    async fn execute(&self, ctx: NodeContext) -> Result<Value, NodeError> {
        Ok(ctx.merged_input())
    }
}

pub struct SetNode;

#[async_trait]
impl NodeHandler for SetNode {
    async fn execute(&self, ctx: NodeContext) -> Result<Value, NodeError> {
        ctx.params()
            .get("values")
            .cloned()
            .ok_or_else(|| NodeError::invalid_param("values", "missing"))
    }
}

/// Supports GET, POST, PUT, DELETE and PATCH. The request body is the
/// `body` parameter, or the node's input for methods that carry one.
pub struct HttpRequestNode {
    client: reqwest::Client,
}

impl HttpRequestNode {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpRequestNode {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeHandler for HttpRequestNode {
    async fn execute(&self, ctx: NodeContext) -> Result<Value, NodeError> {
        let node = ctx.node();
        let url = node
            .param_str("url")
            .ok_or_else(|| NodeError::invalid_param("url", "missing"))?;
        let method = node.param_str("method").unwrap_or("GET").to_uppercase();

        let mut request = match method.as_str() {
            "GET" => self.client.get(url),
            "POST" => self.client.post(url),
            "PUT" => self.client.put(url),
            "DELETE" => self.client.delete(url),
            "PATCH" => self.client.patch(url),
            other => {
                return Err(NodeError::invalid_param(
                    "method",
                    format!("unsupported HTTP method '{}'", other),
                ))
            }
        };

        if let Some(headers) = node.params.get("headers").and_then(Value::as_object) {
            for (key, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(key.as_str(), value);
                }
            }
        }

        let body = node.params.get("body").cloned().or_else(|| {
            matches!(method.as_str(), "POST" | "PUT" | "PATCH").then(|| ctx.merged_input())
        });
        match body {
            Some(Value::String(text)) => request = request.body(text),
            Some(Value::Null) | None => {}
            Some(data) => request = request.json(&data),
        }

        tracing::debug!(node_id = %node.id, "🌍 HTTP Request: {} {}", method, url);

        let response = tokio::select! {
            response = request.send() => response
                .map_err(|e| NodeError::failed(format!("HTTP request failed: {}", e)))?,
            _ = ctx.cancel_token().cancelled() => return Err(NodeError::Cancelled),
        };

        let status = response.status();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.to_string(), s.to_string())))
            .collect();
        let text = response
            .text()
            .await
            .map_err(|e| NodeError::failed(format!("failed to read response body: {}", e)))?;
        let data = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

        tracing::info!(node_id = %node.id, "✅ HTTP request completed: {} {} (status: {})", method, url, status);

        if !status.is_success() && node.params.get("fail_on_status").and_then(Value::as_bool).unwrap_or(true) {
            return Err(NodeError::failed(format!("{} {} returned {}", method, url, status)));
        }

        Ok(json!({
            "status": status.as_u16(),
            "headers": headers,
            "data": data,
            "success": status.is_success(),
        }))
    }
}

/// Params: `event_type` (required), `filter` (condition, optional)
pub struct WaitForEventNode;

#[async_trait]
impl NodeHandler for WaitForEventNode {
    async fn execute(&self, ctx: NodeContext) -> Result<Value, NodeError> {
        let event_type = ctx
            .node()
            .param_str("event_type")
            .ok_or_else(|| NodeError::invalid_param("event_type", "missing"))?
            .to_string();
        let filter = match ctx.params().get("filter") {
            Some(raw) if !raw.is_null() => Some(
                serde_json::from_value::<Condition>(raw.clone())
                    .map_err(|e| NodeError::invalid_param("filter", e.to_string()))?,
            ),
            _ => None,
        };

        ctx.wait_for_event(&event_type, filter).await
    }

    fn cacheable(&self) -> bool {
        false
    }
}

/// Invokes every attached sub-node with the toolkit's input and returns
/// their outputs keyed by sub-node id. Any sub-node failure fails the toolkit.
pub struct ToolkitNode;

#[async_trait]
impl NodeHandler for ToolkitNode {
    async fn execute(&self, ctx: NodeContext) -> Result<Value, NodeError> {
        let input = ctx.merged_input();
        let mut results = Map::new();

        for sub in ctx.sub_nodes() {
            if ctx.is_cancelled() {
                return Err(NodeError::Cancelled);
            }
            let output = ctx
                .invoke_sub_node(&sub.id, input.clone())
                .await
                .map_err(|e| NodeError::failed(format!("sub-node '{}' failed: {}", sub.id, e)))?;
            results.insert(sub.id.clone(), output);
        }

        Ok(json!({ "input": input, "results": results }))
    }

    fn cacheable(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_registered() {
        let registry = builtin_registry();
        for kind in [NO_OP, SET, HTTP_REQUEST, WAIT_FOR_EVENT, kinds::TOOLKIT] {
            assert!(registry.contains(kind), "missing {}", kind);
        }
        assert!(!registry.get(WAIT_FOR_EVENT).unwrap().cacheable());
        assert!(registry.get(SET).unwrap().cacheable());
    }
}
