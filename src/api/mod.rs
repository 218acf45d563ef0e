//! HTTP API consumed by the orchestrator.
//!
//! # Example
//!
//! ```bash
//! # Start the agent
//! vmhost serve --listen 0.0.0.0:8081
//!
//! # Provision a VM
//! curl -X POST http://localhost:8081/provision-vm \
//!   -H "Content-Type: application/json" \
//!   -d '{"vmId": "vm-1", "imageName": "sonoma-14.5.img", "runnerName": "mini-1"}'
//!
//! # Delete it
//! curl -X POST http://localhost:8081/delete-vm -d '{"vmId": "vm-1"}' \
//!   -H "Content-Type: application/json"
//! ```

pub mod error;
pub mod handlers;
pub mod supervisor;
pub mod types;
pub mod validation;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::agent::Agent;

/// Bound on a single request. Pipelines run in the background, so this
/// only covers admission and status reads.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Create the API router with all endpoints.
pub fn create_router(agent: Arc<Agent>) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health))
        .route("/provision-vm", post(handlers::vms::provision_vm))
        .route("/delete-vm", post(handlers::vms::delete_vm))
        .route("/vms", get(handlers::vms::status))
        .route("/status", get(handlers::vms::status))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(TraceLayer::new_for_http())
        .with_state(agent)
}
