/// Error taxonomy for the execution engine
///
/// Library code returns these typed errors; the server and binary wrap them
/// in `anyhow` at the application boundary.

use thiserror::Error;

/// Result alias used across the engine
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised by planning, scheduling, triggering and recovery
#[derive(Debug, Error)]
pub enum EngineError {
    /// Workflow failed structural validation (duplicate ids, dangling edges)
    #[error("invalid workflow '{workflow_id}': {message}")]
    InvalidWorkflow { workflow_id: String, message: String },

    /// Planner found a cycle; the run never starts
    #[error("workflow '{workflow_id}' contains a cycle through node '{node_id}'")]
    CyclicGraph { workflow_id: String, node_id: String },

    /// A node callable failed
    #[error("node '{node_id}' failed: {message}")]
    NodeExecution { node_id: String, message: String },

    /// Waiting on another holder's cache lock ran out of time
    #[error("timed out waiting for cache lock on '{key}'")]
    CacheLockTimeout { key: String },

    /// Recovery declared the run orphaned
    #[error("run '{run_id}' crashed: heartbeat stale for {stale_secs}s")]
    CrashedRun { run_id: String, stale_secs: i64 },

    /// Cooperative cancellation was observed
    #[error("run '{run_id}' cancelled")]
    Cancelled { run_id: String },

    /// The task driving a run panicked or was aborted
    #[error("run '{run_id}' aborted: {message}")]
    RunAborted { run_id: String, message: String },

    /// No handler registered for a node kind
    #[error("no handler registered for node kind '{0}'")]
    UnknownNodeKind(String),

    /// A second waiter was requested for a node whose policy forbids it
    #[error("node '{node_id}' already has an outstanding waiter")]
    WaiterConflict { node_id: String },

    /// Operation referenced a workflow that is not deployed
    #[error("workflow '{0}' is not deployed")]
    DeploymentNotFound(String),

    /// Trigger node parameters are missing or malformed
    #[error("trigger '{node_id}' misconfigured: {message}")]
    TriggerConfig { node_id: String, message: String },

    /// Deployment persistence failed
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Timer scheduler rejected a job
    #[error("scheduler error: {0}")]
    Scheduler(String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

/// Failure returned by a node callable
#[derive(Debug, Clone, Error)]
pub enum NodeError {
    #[error("{0}")]
    Failed(String),

    #[error("invalid parameter '{param}': {message}")]
    InvalidParams { param: String, message: String },

    #[error("cancelled")]
    Cancelled,

    #[error("no handler registered for node kind '{0}'")]
    UnknownKind(String),
}

impl NodeError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn invalid_param(param: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidParams {
            param: param.into(),
            message: message.into(),
        }
    }
}

/// Failure of a cache tier operation
#[derive(Debug, Error)]
pub enum CacheError {
    /// Tier could not serve the request; callers fall through to the next tier
    #[error("cache tier '{tier}' unavailable: {message}")]
    Unavailable { tier: &'static str, message: String },

    #[error("cache value serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CacheError {
    pub fn unavailable(tier: &'static str, message: impl ToString) -> Self {
        Self::Unavailable {
            tier,
            message: message.to_string(),
        }
    }
}
