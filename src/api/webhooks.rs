/// Event ingress endpoint
///
/// Every request body becomes an event payload dispatched to the waiters of
/// the event type named in the path: push triggers and in-run
/// `waitForEvent` nodes alike.

use crate::api::deployments::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::post,
    Router,
};
use serde_json::{json, Value};

pub fn create_webhook_routes() -> Router<AppState> {
    Router::new().route("/webhook/{event_type}", post(dispatch_event))
}

/// POST /webhook/{event_type}
/// Body: JSON payload (empty body is treated as `{}`)
/// Returns: { "event_type": "...", "resolved": n }
async fn dispatch_event(
    State(state): State<AppState>,
    Path(event_type): Path<String>,
    body: String,
) -> Result<Json<Value>, StatusCode> {
    tracing::info!("📥 Event received: {}", event_type);

    let payload: Value = if body.trim().is_empty() {
        json!({})
    } else {
        match serde_json::from_str(&body) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!("❌ Invalid JSON payload for event '{}': {}", event_type, e);
                return Err(StatusCode::BAD_REQUEST);
            }
        }
    };

    let resolved = state.manager.dispatch_event(&event_type, &payload);
    if resolved == 0 {
        tracing::debug!("🔍 No waiter matched event '{}'", event_type);
    }

    Ok(Json(json!({ "event_type": event_type, "resolved": resolved })))
}
