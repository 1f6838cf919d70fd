//! Sensor Routes

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::error::ApiError;
use crate::AppState;
use alerting::{MetricsSummary, Status};

/// Body of a measurement submission
#[derive(Debug, Deserialize)]
pub struct MeasurementRequest {
    /// CO2 level in ppm
    pub co2: i64,
    /// ISO-8601 timestamp of the reading
    pub time: DateTime<Utc>,
}

/// Response for the status endpoint
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: Status,
}

/// Record a measurement and update the sensor's alert state
pub async fn post_measurement(
    State(state): State<Arc<AppState>>,
    Path(sensor_id): Path<String>,
    payload: Result<Json<MeasurementRequest>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(request) = payload?;

    let transition = state
        .service
        .ingest(&sensor_id, request.co2, request.time)
        .await?;
    debug!(%sensor_id, ?transition, "Measurement accepted");

    Ok(StatusCode::CREATED)
}

/// Get sensor status
pub async fn get_status(
    State(state): State<Arc<AppState>>,
    Path(sensor_id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let status = state.service.status(&sensor_id).await?;
    Ok(Json(StatusResponse { status }))
}

/// Get max / average CO2 over the last 30 days
pub async fn get_metrics(
    State(state): State<Arc<AppState>>,
    Path(sensor_id): Path<String>,
) -> Result<Json<MetricsSummary>, ApiError> {
    Ok(Json(state.service.metrics(&sensor_id).await?))
}
