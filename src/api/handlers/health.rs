//! Health check endpoint.

use axum::Json;

use crate::api::types::HealthResponse;

/// GET /health - Liveness of the agent process.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: crate::VERSION.to_string(),
    })
}
