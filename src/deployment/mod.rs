/// Deployment management
///
/// Turns a deployed workflow's trigger nodes into armed triggers and exposes
/// the programmatic surface: deploy, cancel, status, manual runs and waiter
/// control.

// Trigger arming, run launching and deployment lifecycle
pub mod manager;

// Armed-trigger bookkeeping and status views
pub mod state;

pub use manager::DeploymentManager;
pub use state::{DeploymentState, DeploymentStatus, TriggerStatus};
