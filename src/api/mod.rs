/// HTTP API Layer
///
/// REST endpoints over the deployment manager plus the event ingress used by
/// push triggers and in-run waits.

// Deployment, run and waiter management endpoints
pub mod deployments;

// Server-sent status stream
pub mod events;

// Event dispatch endpoint
pub mod webhooks;

// Re-export router builders
pub use deployments::{create_deployment_routes, AppState};
pub use events::create_event_routes;
pub use webhooks::create_webhook_routes;
