/// Workflow Management Layer
///
/// Workflow definitions, the hot-swap registry of deployed workflows and
/// their SQLite persistence.

// Core workflow type definitions
pub mod types;

// SQLite persistence for deployed workflows
pub mod storage;

// Hot-swap registry of deployed workflows using ArcSwap
pub mod registry;

// Re-export commonly used types
pub use registry::{CompiledWorkflow, WorkflowRegistry};
pub use storage::DeploymentStorage;
pub use types::{Edge, EdgeKind, Node, TriggerKind, Workflow};
