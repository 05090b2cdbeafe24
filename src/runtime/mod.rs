/// Runtime Execution Engine
///
/// Planning, condition evaluation, the decide-loop scheduler and the node
/// invocation path (registry lookup, memoization, concurrency budget).

// Topological planning over petgraph, sub-node exclusion
pub mod planner;

// Pure edge-condition evaluation
pub mod condition;

// Run state and the run registry
pub mod run;

// SQLite persistence for run records
pub mod run_store;

// Status events pushed to the broadcaster
pub mod events;

// Node registry and cache-aware node invocation
pub mod executor;

// Generic built-in node kinds
pub mod nodes;

// Decide-loop scheduler
pub mod engine;

// Re-export main types
pub use engine::{ExecutionEngine, RunHandle, TriggerFiring};
pub use events::{ChannelSink, NoopSink, StatusEvent, StatusSink};
pub use executor::{NodeContext, NodeHandler, NodeRegistry};
pub use planner::{ExecutionPlan, GraphPlanner};
pub use run::{NodeStatus, RunRecord, RunStatus};
pub use run_store::RunStorage;
