use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;

/// GET /health: liveness check plus worker identity.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "worker_id": state.scheduler.worker_id(),
        "poll_interval_secs": state.config.scheduler.poll_interval_secs,
        "scheduling_failures": state.health.failures(),
    }))
}
