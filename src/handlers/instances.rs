use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use crate::models::*;
use crate::AppState;

use super::{created, ApiError};

/// List all registered instances
pub async fn list_instances(State(state): State<Arc<AppState>>) -> Json<Vec<Instance>> {
    Json(state.control.instances().list())
}

/// Get a single instance by id
pub async fn get_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Instance>, ApiError> {
    let instance = state.control.instances().get(&id)?;
    Ok(Json(instance))
}

/// Register a new instance
pub async fn register_instance(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterInstanceRequest>,
) -> Result<(StatusCode, Json<Instance>), ApiError> {
    if req.id.is_empty() || req.host.is_empty() || req.username.is_empty() {
        return Err(ApiError::bad_request("id, host and username are required"));
    }
    if req.version.is_empty() {
        return Err(ApiError::bad_request("version is required"));
    }

    let endpoint = req.endpoint(state.config.ssh_default_port);
    let instance = state
        .control
        .register_instance(&req.id, endpoint, &req.version)
        .await?;
    Ok(created(instance))
}

/// Deregister an instance, closing its session first
pub async fn deregister_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.control.deregister_instance(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
