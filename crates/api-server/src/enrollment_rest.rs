//! Enrollment lifecycle and execution log endpoints.

use axum::extract::{Path, State};
use axum::Json;
use clinicflow_scenario::clock::Clock;
use clinicflow_scenario::types::{Enrollment, ExecutionLogEntry};
use uuid::Uuid;

use crate::rest::{ApiError, ApiResult, AppState};

/// GET /v1/enrollments/:id
pub async fn get_enrollment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Enrollment>> {
    state
        .engine
        .get_enrollment(&id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("enrollment {} not found", id)))
}

/// POST /v1/enrollments/:id/pause
pub async fn pause(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Enrollment>> {
    Ok(Json(state.engine.pause(&id)?))
}

/// POST /v1/enrollments/:id/resume
pub async fn resume(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Enrollment>> {
    Ok(Json(state.engine.resume(&id)?))
}

/// POST /v1/enrollments/:id/exit — Unenroll.
pub async fn exit(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Enrollment>> {
    Ok(Json(state.engine.exit(&id)?))
}

/// GET /v1/enrollments/:id/logs
pub async fn logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<ExecutionLogEntry>>> {
    if state.engine.get_enrollment(&id).is_none() {
        return Err(ApiError::not_found(format!("enrollment {} not found", id)));
    }
    Ok(Json(state.engine.execution_log(&id)))
}

/// GET /v1/enrollments/stuck
pub async fn stuck(State(state): State<AppState>) -> Json<Vec<Enrollment>> {
    let now = state.engine.context().clock.now();
    Json(state.engine.stuck_enrollments(now))
}
