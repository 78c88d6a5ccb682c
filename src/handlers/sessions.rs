use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use crate::session::SessionInfo;
use crate::AppState;

use super::ApiError;

/// Open (or reuse) the instance's session
pub async fn open_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SessionInfo>, ApiError> {
    let info = state.control.sessions().open(&id).await?;
    Ok(Json(info))
}

/// Current session state
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SessionInfo>, ApiError> {
    let info = state.control.sessions().info(&id)?;
    Ok(Json(info))
}

/// Close the session, preempting any apply in flight
pub async fn close_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.control.sessions().close(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
