use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::models::FeatureArea;
use crate::AppState;

use super::ApiError;

#[derive(Serialize)]
pub struct FeatureAreaVersions {
    pub feature_area: FeatureArea,
    pub versions: BTreeSet<String>,
}

/// List feature areas with the versions each can render for
pub async fn list_feature_areas(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<FeatureAreaVersions>>, ApiError> {
    let mut areas = Vec::new();
    for area in state.control.feature_areas() {
        areas.push(FeatureAreaVersions {
            feature_area: area,
            versions: state.control.list_supported_versions(area)?,
        });
    }
    Ok(Json(areas))
}

/// Supported versions for one feature area
pub async fn list_versions(
    State(state): State<Arc<AppState>>,
    Path(area): Path<String>,
) -> Result<Json<FeatureAreaVersions>, ApiError> {
    let area: FeatureArea = area.parse()?;
    let versions = state.control.list_supported_versions(area)?;
    Ok(Json(FeatureAreaVersions {
        feature_area: area,
        versions,
    }))
}
