use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::models::*;
use crate::session::ApplyOptions;
use crate::AppState;

use super::ApiError;

#[derive(Debug, Deserialize)]
pub struct ApplyQuery {
    #[serde(default)]
    pub mode: ApplyMode,
}

#[derive(Serialize)]
pub struct ApplyResponse {
    pub instance_id: String,
    pub feature_area: FeatureArea,
    pub operation: Operation,
    pub applied: bool,
    pub results: Vec<ApplyResult>,
}

#[derive(Serialize)]
pub struct PreviewResponse {
    pub instance_id: String,
    pub feature_area: FeatureArea,
    pub operation: Operation,
    pub version: String,
    pub commands: Vec<String>,
}

fn parse(area: &str, body: serde_json::Value) -> Result<(FeatureArea, CommandModel), ApiError> {
    let area: FeatureArea = area.parse()?;
    let model = CommandModel::from_json(area, body)?;
    Ok((area, model))
}

/// Render and apply an intent.
///
/// The apply runs on its own task; if the client goes away the call is
/// cancelled and the session torn down rather than left mid-transaction.
pub async fn apply_intent(
    State(state): State<Arc<AppState>>,
    Path((id, area)): Path<(String, String)>,
    Query(query): Query<ApplyQuery>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<ApplyResponse>, ApiError> {
    let (area, model) = parse(&area, body)?;
    let operation = model.operation();

    let cancel = tokio_util::sync::CancellationToken::new();
    let _disconnect = cancel.clone().drop_guard();
    let options = ApplyOptions {
        mode: query.mode,
        cancel: Some(cancel),
    };

    let control = state.control.clone();
    let instance_id = id.clone();
    let results = tokio::spawn(async move {
        control
            .apply_intent(&instance_id, area, &model, options)
            .await
    })
    .await
    .map_err(|e| ApiError::internal(format!("apply task failed: {}", e)))??;

    Ok(Json(ApplyResponse {
        instance_id: id,
        feature_area: area,
        operation,
        applied: all_applied(&results),
        results,
    }))
}

/// Render an intent without touching the device
pub async fn preview_intent(
    State(state): State<Arc<AppState>>,
    Path((id, area)): Path<(String, String)>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<PreviewResponse>, ApiError> {
    let (area, model) = parse(&area, body)?;
    let commands = state.control.preview_intent(&id, area, &model)?;
    let version = state.control.instances().get(&id)?.version;
    Ok(Json(PreviewResponse {
        instance_id: id,
        feature_area: area,
        operation: model.operation(),
        version,
        commands,
    }))
}
