//! Alert Routes

use axum::{
    extract::{Path, State},
    Json,
};
use std::sync::Arc;

use crate::error::ApiError;
use crate::AppState;
use alerting::AlertSummary;

/// Get alert episodes of a sensor, oldest first
pub async fn get_alerts(
    State(state): State<Arc<AppState>>,
    Path(sensor_id): Path<String>,
) -> Result<Json<Vec<AlertSummary>>, ApiError> {
    Ok(Json(state.service.alerts(&sensor_id).await?))
}
