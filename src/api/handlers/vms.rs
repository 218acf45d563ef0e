//! VM lifecycle handlers.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use crate::agent::{Agent, NodeStatus};
use crate::api::error::ApiError;
use crate::api::types::{DeleteRequest, DeleteResponse, ProvisionResponse};
use crate::provision::ProvisionRequest;

/// POST /provision-vm - Admit a VM and provision it in the background.
pub async fn provision_vm(
    State(agent): State<Arc<Agent>>,
    body: Result<Json<ProvisionRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ProvisionResponse>), ApiError> {
    let Json(request) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let accepted = agent.provision(request)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(ProvisionResponse {
            message: format!("VM '{}' provisioning started", accepted.vm_id),
            vm_id: accepted.vm_id,
            node_id: accepted.node_id,
        }),
    ))
}

/// POST /delete-vm - Tear a VM down in the background.
pub async fn delete_vm(
    State(agent): State<Arc<Agent>>,
    body: Result<Json<DeleteRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<DeleteResponse>), ApiError> {
    let Json(request) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let accepted = agent.delete(&request.vm_id)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(DeleteResponse {
            message: format!("VM '{}' deletion started", accepted.vm_id),
            vm_id: accepted.vm_id,
        }),
    ))
}

/// GET /status and GET /vms - Node status with every registered VM.
pub async fn status(State(agent): State<Arc<Agent>>) -> Json<NodeStatus> {
    Json(agent.status())
}
