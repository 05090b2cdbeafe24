/// Server setup and initialization
///
/// Wires together all components: cache tiers, waiter registry, execution
/// engine, deployment manager, reaper and HTTP routes.

use crate::{
    api::{create_deployment_routes, create_event_routes, create_webhook_routes, AppState},
    cache::TieredCache,
    config::Config,
    deployment::DeploymentManager,
    recovery::Reaper,
    runtime::{engine::ExecutionEngine, events::BroadcastSink, nodes::builtin_registry, RunStorage},
    trigger::{EventWaiter, PollSources},
    workflow::storage::DeploymentStorage,
};
use anyhow::{Context, Result};
use axum::{routing::get, Router};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Running application: the router plus the handles needed for shutdown
pub struct App {
    pub router: Router,
    pub manager: Arc<DeploymentManager>,
    pub background: CancellationToken,
}

/// Build every component and restore persisted deployments
pub async fn create_app(config: Config) -> Result<App> {
    tracing::info!("📁 Ensuring data directory exists: {}", config.database.data_dir);
    let data_dir = Path::new(&config.database.data_dir);
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

    tracing::info!("🗄️ Initializing cache tiers");
    let cache = Arc::new(TieredCache::from_config(config.cache.clone(), data_dir).await);

    tracing::info!("🗃️ Initializing run storage");
    let run_storage = RunStorage::connect(data_dir.join("runs.db"))
        .await
        .context("Failed to open run storage")?;

    tracing::info!("🚀 Initializing execution engine");
    let waiters = Arc::new(EventWaiter::new());
    let events = BroadcastSink::new(config.engine.event_buffer);
    let engine = Arc::new(ExecutionEngine::new(
        builtin_registry(),
        Arc::clone(&cache),
        Arc::clone(&waiters),
        Arc::new(events.clone()),
        config.engine.clone(),
    )
    .with_run_storage(run_storage.clone()));

    tracing::info!("📋 Initializing deployment storage");
    let storage = DeploymentStorage::connect(data_dir.join("deployments.db"))
        .await
        .context("Failed to open deployment storage")?;

    let manager = Arc::new(
        DeploymentManager::new(Arc::clone(&engine), PollSources::with_builtins(), Some(storage))
            .await
            .context("Failed to initialize deployment manager")?,
    );
    manager.start().await.context("Failed to start cron scheduler")?;
    manager.restore().await.context("Failed to restore deployments")?;

    tracing::info!("🧹 Starting reaper");
    let background = CancellationToken::new();
    let reaper = Arc::new(Reaper::new(
        Arc::clone(engine.runs()),
        engine.heartbeats().clone(),
        waiters,
        Arc::clone(engine.sink()),
        config.engine.heartbeat_stale(),
    )
    .with_retention(config.engine.run_retention())
    .with_storage(run_storage));
    reaper.spawn(config.engine.reaper_interval(), background.clone());

    let state = AppState {
        manager: Arc::clone(&manager),
        events,
    };

    tracing::info!("📡 Creating HTTP router with all endpoints");
    let router = Router::new()
        .route("/healthz", get(health_check))
        .merge(create_deployment_routes())
        .merge(create_webhook_routes())
        .merge(create_event_routes())
        .with_state(state);

    tracing::info!("✅ Application initialized successfully");
    Ok(App {
        router,
        manager,
        background,
    })
}

/// Start the HTTP server with the given configuration
pub async fn start_server(config: Config) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("flowloom=info")))
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting Flowloom server...");
    let app = create_app(config.clone()).await?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("🛑 Shutting down");
    app.background.cancel();
    app.manager.shutdown().await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("❌ Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

async fn health_check() -> &'static str {
    "ok"
}
