//! Shared REST state, error mapping and operational endpoints.

use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use clinicflow_core::ClinicFlowError;
use clinicflow_scenario::ScenarioEngine;
use serde::Serialize;
use tracing::error;

/// Shared application state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: ScenarioEngine,
    pub node_id: String,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(engine: ScenarioEngine, node_id: impl Into<String>) -> Self {
        Self {
            engine,
            node_id: node_id.into(),
            start_time: Instant::now(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// Handler error: an engine error or a bare status with a reason.
#[derive(Debug)]
pub enum ApiError {
    Engine(ClinicFlowError),
    Status(StatusCode, &'static str, String),
}

impl ApiError {
    pub fn not_found(message: impl Into<String>) -> Self {
        ApiError::Status(StatusCode::NOT_FOUND, "not_found", message.into())
    }

    pub fn conflict(code: &'static str, message: impl Into<String>) -> Self {
        ApiError::Status(StatusCode::CONFLICT, code, message.into())
    }
}

impl From<ClinicFlowError> for ApiError {
    fn from(err: ClinicFlowError) -> Self {
        ApiError::Engine(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::Status(status, code, message) => (status, code, message),
            ApiError::Engine(err) => {
                let (status, code) = match &err {
                    ClinicFlowError::Definition(_) => (StatusCode::BAD_REQUEST, "invalid_definition"),
                    ClinicFlowError::ScenarioNotFound(_) | ClinicFlowError::EnrollmentNotFound(_) => {
                        (StatusCode::NOT_FOUND, "not_found")
                    }
                    ClinicFlowError::InvalidTransition { .. } => {
                        (StatusCode::CONFLICT, "invalid_transition")
                    }
                    _ => {
                        error!(error = %err, "Request failed");
                        (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
                    }
                };
                (status, code, err.to_string())
            }
        };
        if status.is_client_error() {
            metrics::counter!("api.client_errors").increment(1);
        } else {
            metrics::counter!("api.errors").increment(1);
        }
        (
            status,
            Json(ErrorResponse {
                error: code.to_string(),
                message,
            }),
        )
            .into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub uptime_secs: u64,
    pub scenarios: usize,
}

/// GET /health — Health check endpoint.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        node_id: state.node_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        scenarios: state.engine.list_scenarios().len(),
    })
}

/// GET /live — Liveness probe.
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}
