/// Flowloom: workflow execution engine
///
/// Plans workflow graphs, drives each run with a continuous decide-loop,
/// memoizes node outputs on a three-tier cache guarded by a distributed lock,
/// reaps runs whose heartbeat went stale and arms push, poll and timer
/// triggers for deployed workflows.

// Core configuration and setup
pub mod config;

// Typed error taxonomy
pub mod error;

// Cache tiers, key derivation and the distributed lock
pub mod cache;

// Workflow definitions, deployed-workflow registry and persistence
pub mod workflow;

// Planner, condition evaluator, node invocation and the decide-loop scheduler
pub mod runtime;

// Event waiter and trigger strategies
pub mod trigger;

// Deployment manager
pub mod deployment;

// Heartbeats and the orphaned-run reaper
pub mod recovery;

// HTTP API layer
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use cache::TieredCache;
pub use deployment::DeploymentManager;
pub use error::{EngineError, NodeError, Result};
pub use runtime::{ExecutionEngine, NodeRegistry, TriggerFiring};
pub use server::start_server;
pub use trigger::EventWaiter;
pub use workflow::{Edge, Node, Workflow};
