//! Wire types for the HTTP API.
//!
//! The provision request body is [`crate::provision::ProvisionRequest`]; the
//! status body is [`crate::agent::NodeStatus`].

use serde::{Deserialize, Serialize};

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always "ok".
    pub status: String,
    /// Agent version.
    pub version: String,
}

/// Error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiErrorResponse {
    /// Error message.
    pub error: String,
    /// Whether the same request may succeed later.
    pub retryable: bool,
}

/// Provision command accepted.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionResponse {
    /// Human-readable message.
    pub message: String,
    /// VM id.
    pub vm_id: String,
    /// Node that accepted the command.
    pub node_id: String,
}

/// Delete command.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRequest {
    /// VM id.
    #[serde(default)]
    pub vm_id: String,
}

/// Delete command accepted.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteResponse {
    /// Human-readable message.
    pub message: String,
    /// VM id.
    pub vm_id: String,
}
