/// Deployment, run and waiter management REST API endpoints
///
/// Thin JSON layer over `DeploymentManager`: every handler delegates to one
/// manager operation and maps `EngineError` onto an HTTP status.

use crate::deployment::{DeploymentManager, DeploymentStatus};
use crate::error::EngineError;
use crate::runtime::events::BroadcastSink;
use crate::runtime::run::RunRecord;
use crate::trigger::WaiterInfo;
use crate::workflow::types::Workflow;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

/// Application state shared by every route
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<DeploymentManager>,
    pub events: BroadcastSink,
}

/// JSON error body plus status
pub type ApiError = (StatusCode, Json<Value>);

/// Request body for a deploy call
#[derive(Debug, Deserialize)]
pub struct DeployRequest {
    pub workflow: Workflow,
}

pub fn error_response(error: &EngineError) -> ApiError {
    let status = match error {
        EngineError::InvalidWorkflow { .. }
        | EngineError::CyclicGraph { .. }
        | EngineError::UnknownNodeKind(_)
        | EngineError::TriggerConfig { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::DeploymentNotFound(_) => StatusCode::NOT_FOUND,
        EngineError::WaiterConflict { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!(error = %error, "❌ Request failed");
    } else {
        tracing::warn!(error = %error, "⚠️ Request rejected");
    }
    (status, Json(json!({ "error": error.to_string() })))
}

fn not_found(what: &str, id: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": format!("{} '{}' not found", what, id) })),
    )
}

pub fn create_deployment_routes() -> Router<AppState> {
    Router::new()
        .route("/api/deployments", post(deploy).get(list_deployments))
        .route("/api/deployments/{id}", get(deployment_status).delete(cancel_deployment))
        .route("/api/deployments/{id}/runs", post(run_now))
        .route("/api/runs/{run_id}", get(run_status).delete(cancel_run))
        .route("/api/waiters", get(active_waiters))
        .route("/api/waiters/{waiter_id}", delete(cancel_waiter))
        .route("/api/waiters/node/{node_id}", delete(cancel_node_waiters))
}

/// POST /api/deployments
/// Body: { "workflow": { "id": "...", "nodes": [...], "edges": [...] } }
async fn deploy(
    State(state): State<AppState>,
    Json(payload): Json<DeployRequest>,
) -> Result<(StatusCode, Json<DeploymentStatus>), ApiError> {
    let status = state
        .manager
        .deploy(payload.workflow)
        .await
        .map_err(|e| error_response(&e))?;
    Ok((StatusCode::CREATED, Json(status)))
}

/// GET /api/deployments
async fn list_deployments(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "deployments": state.manager.list().await }))
}

/// GET /api/deployments/{id}
async fn deployment_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeploymentStatus>, ApiError> {
    state
        .manager
        .get_status(&id)
        .await
        .map(Json)
        .map_err(|e| error_response(&e))
}

/// DELETE /api/deployments/{id}
async fn cancel_deployment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.manager.cancel(&id).await.map_err(|e| error_response(&e))?;
    Ok(Json(json!({ "message": format!("Deployment '{}' cancelled", id) })))
}

/// POST /api/deployments/{id}/runs
/// Body: trigger payload (optional)
async fn run_now(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: String,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let payload = if body.trim().is_empty() {
        json!({})
    } else {
        serde_json::from_str(&body).map_err(|e| {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("invalid JSON payload: {}", e) })),
            )
        })?
    };
    let run_id = state.manager.run_now(&id, payload).map_err(|e| error_response(&e))?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "run_id": run_id }))))
}

/// GET /api/runs/{run_id}
async fn run_status(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<RunRecord>, ApiError> {
    state
        .manager
        .run_status(&run_id)
        .await
        .map(Json)
        .ok_or_else(|| not_found("run", &run_id))
}

/// DELETE /api/runs/{run_id}
async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if state.manager.cancel_run(&run_id) {
        Ok(Json(json!({ "message": format!("Run '{}' cancellation requested", run_id) })))
    } else {
        Err(not_found("active run", &run_id))
    }
}

/// GET /api/waiters
async fn active_waiters(State(state): State<AppState>) -> Json<Vec<WaiterInfo>> {
    Json(state.manager.active_waiters())
}

/// DELETE /api/waiters/{waiter_id}
async fn cancel_waiter(
    State(state): State<AppState>,
    Path(waiter_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if state.manager.cancel_event_wait(&waiter_id) {
        Ok(Json(json!({ "cancelled": 1 })))
    } else {
        Err(not_found("waiter", &waiter_id))
    }
}

/// DELETE /api/waiters/node/{node_id}
async fn cancel_node_waiters(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> Json<Value> {
    Json(json!({ "cancelled": state.manager.cancel_event_wait_for_node(&node_id) }))
}
