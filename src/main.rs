/// Flowloom: workflow execution engine
///
/// Main entry point. Loads configuration from the environment and starts the
/// HTTP server with the deployment, run and event endpoints.

use flowloom::{config::Config, server::start_server};

/// The server provides:
/// - Deployment management at /api/deployments/*
/// - Run status and cancellation at /api/runs/*
/// - Waiter inspection at /api/waiters/*
/// - Event ingress at /webhook/{event_type}
/// - Health check at /healthz
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::default();
    start_server(config).await
}
