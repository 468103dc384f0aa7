//! Job administration routes over [`JobAdmin`](classroom_scheduler::JobAdmin).

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::{DateTime, Utc};
use classroom_scheduler::{JobStats, JobView};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use super::error::ApiError;
use crate::app::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RescheduleRequest {
    pub new_time: DateTime<Utc>,
}

/// GET /jobs
pub async fn list_jobs(State(state): State<Arc<AppState>>) -> Result<Json<Vec<JobView>>, ApiError> {
    Ok(Json(state.jobs.list_all()?))
}

/// GET /jobs/class/{class_id}
pub async fn list_class_jobs(
    State(state): State<Arc<AppState>>,
    Path(class_id): Path<String>,
) -> Result<Json<Vec<JobView>>, ApiError> {
    Ok(Json(state.jobs.list_for_class(&class_id)?))
}

/// GET /jobs/stats
pub async fn job_stats(State(state): State<Arc<AppState>>) -> Result<Json<JobStats>, ApiError> {
    Ok(Json(state.jobs.stats()?))
}

/// PUT /jobs/{id}/reschedule
pub async fn reschedule_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<RescheduleRequest>,
) -> Result<Json<JobView>, ApiError> {
    let view = state.jobs.reschedule(&id, req.new_time)?;
    info!(job_id = %id, run_at = %req.new_time, "job rescheduled by operator");
    Ok(Json(view))
}

/// DELETE /jobs/{id}
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.jobs.cancel(&id)?;
    info!(job_id = %id, "job cancelled by operator");
    Ok(Json(json!({ "deleted": id })))
}

/// POST /jobs/{id}/disable
pub async fn disable_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JobView>, ApiError> {
    Ok(Json(state.jobs.disable(&id)?))
}

/// POST /jobs/{id}/enable
pub async fn enable_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JobView>, ApiError> {
    Ok(Json(state.jobs.enable(&id)?))
}
