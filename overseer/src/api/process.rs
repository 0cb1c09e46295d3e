//! Worker process control endpoints

use std::time::Duration;

use axum::extract::{Query, State};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use shared_types::ProcessStatus;

use super::{ApiError, ApiState};

#[derive(Debug, Deserialize)]
pub struct StopQuery {
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct ProcessStatusResponse {
    #[serde(flatten)]
    pub status: ProcessStatus,
    pub uptime_seconds: Option<u64>,
}

impl From<ProcessStatus> for ProcessStatusResponse {
    fn from(status: ProcessStatus) -> Self {
        let uptime_seconds = status.uptime_seconds(Utc::now());
        Self {
            status,
            uptime_seconds,
        }
    }
}

pub async fn get_status(State(state): State<ApiState>) -> Json<ProcessStatusResponse> {
    Json(state.app_state.supervisor().status().into())
}

pub async fn start(
    State(state): State<ApiState>,
) -> Result<Json<ProcessStatusResponse>, ApiError> {
    let status = state.app_state.supervisor().start().await?;
    Ok(Json(status.into()))
}

pub async fn stop(
    State(state): State<ApiState>,
    Query(query): Query<StopQuery>,
) -> Result<Json<ProcessStatusResponse>, ApiError> {
    let timeout = query.timeout_secs.map(Duration::from_secs);
    let status = state.app_state.supervisor().stop(timeout).await?;
    Ok(Json(status.into()))
}

pub async fn restart(
    State(state): State<ApiState>,
    Query(query): Query<StopQuery>,
) -> Result<Json<ProcessStatusResponse>, ApiError> {
    let timeout = query.timeout_secs.map(Duration::from_secs);
    let status = state.app_state.supervisor().restart(timeout).await?;
    Ok(Json(status.into()))
}
