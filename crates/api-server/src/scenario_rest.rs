//! Scenario definition endpoints and inbound events.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use clinicflow_scenario::types::{Enrollment, ScenarioDefinition, ScenarioStats};
use clinicflow_scenario::TriggerEvent;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::rest::{ApiError, ApiResult, AppState};

/// POST /v1/scenarios — Validate and store a new scenario version.
pub async fn save_scenario(
    State(state): State<AppState>,
    Json(scenario): Json<ScenarioDefinition>,
) -> ApiResult<(StatusCode, Json<ScenarioDefinition>)> {
    let saved = state.engine.save_scenario(scenario)?;
    metrics::counter!("api.scenarios.saved").increment(1);
    Ok((StatusCode::CREATED, Json((*saved).clone())))
}

/// GET /v1/scenarios
pub async fn list_scenarios(State(state): State<AppState>) -> Json<Vec<ScenarioDefinition>> {
    let all = state
        .engine
        .list_scenarios()
        .into_iter()
        .map(|s| (*s).clone())
        .collect();
    Json(all)
}

/// GET /v1/scenarios/:id
pub async fn get_scenario(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ScenarioDefinition>> {
    state
        .engine
        .get_scenario(&id)
        .map(|s| Json((*s).clone()))
        .ok_or_else(|| ApiError::not_found(format!("scenario {} not found", id)))
}

#[derive(Debug, Deserialize)]
pub struct EnabledRequest {
    pub enabled: bool,
}

/// POST /v1/scenarios/:id/enabled
pub async fn set_enabled(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<EnabledRequest>,
) -> ApiResult<Json<ScenarioDefinition>> {
    let saved = state.engine.set_scenario_enabled(&id, body.enabled)?;
    Ok(Json((*saved).clone()))
}

#[derive(Debug, Deserialize)]
pub struct EnrollRequest {
    pub recipient_id: String,
}

/// POST /v1/scenarios/:id/enroll — Manual enrollment of one recipient.
pub async fn enroll(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<EnrollRequest>,
) -> ApiResult<(StatusCode, Json<Enrollment>)> {
    match state.engine.enroll_manual(&id, &body.recipient_id)? {
        Some(enrollment) => Ok((StatusCode::CREATED, Json(enrollment))),
        None => Err(ApiError::conflict(
            "already_enrolled",
            format!("{} already has a live enrollment in {}", body.recipient_id, id),
        )),
    }
}

#[derive(Debug, Deserialize)]
pub struct ApplyToAllRequest {
    pub recipient_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct EnrollmentsResponse {
    pub count: usize,
    pub enrollments: Vec<Enrollment>,
}

impl From<Vec<Enrollment>> for EnrollmentsResponse {
    fn from(enrollments: Vec<Enrollment>) -> Self {
        Self {
            count: enrollments.len(),
            enrollments,
        }
    }
}

/// POST /v1/scenarios/:id/apply-to-all
pub async fn apply_to_all(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ApplyToAllRequest>,
) -> ApiResult<Json<EnrollmentsResponse>> {
    let created = state.engine.apply_to_all(&id, &body.recipient_ids).await?;
    Ok(Json(created.into()))
}

/// GET /v1/scenarios/:id/stats
pub async fn stats(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ScenarioStats>> {
    if state.engine.get_scenario(&id).is_none() {
        return Err(ApiError::not_found(format!("scenario {} not found", id)));
    }
    Ok(Json(state.engine.scenario_stats(&id)))
}

/// POST /v1/events — Inbound domain event.
pub async fn ingest_event(
    State(state): State<AppState>,
    Json(event): Json<TriggerEvent>,
) -> ApiResult<(StatusCode, Json<EnrollmentsResponse>)> {
    let created = state.engine.handle_event(&event).await?;
    info!(
        event_type = ?event.kind.trigger_kind(),
        enrolled = created.len(),
        "Event ingested"
    );
    Ok((StatusCode::ACCEPTED, Json(created.into())))
}
