//! API server — operator REST surface and Prometheus exporter.

use std::net::SocketAddr;

use axum::routing::{get, post};
use axum::Router;
use clinicflow_core::config::AppConfig;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::rest::{self, AppState};
use crate::{enrollment_rest, scenario_rest};

/// Builds the operator router over `state`.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Scenario definitions
        .route(
            "/v1/scenarios",
            post(scenario_rest::save_scenario).get(scenario_rest::list_scenarios),
        )
        .route("/v1/scenarios/:id", get(scenario_rest::get_scenario))
        .route("/v1/scenarios/:id/enabled", post(scenario_rest::set_enabled))
        .route("/v1/scenarios/:id/enroll", post(scenario_rest::enroll))
        .route("/v1/scenarios/:id/apply-to-all", post(scenario_rest::apply_to_all))
        .route("/v1/scenarios/:id/stats", get(scenario_rest::stats))
        // Inbound events
        .route("/v1/events", post(scenario_rest::ingest_event))
        // Enrollments
        .route("/v1/enrollments/stuck", get(enrollment_rest::stuck))
        .route("/v1/enrollments/:id", get(enrollment_rest::get_enrollment))
        .route("/v1/enrollments/:id/pause", post(enrollment_rest::pause))
        .route("/v1/enrollments/:id/resume", post(enrollment_rest::resume))
        .route("/v1/enrollments/:id/exit", post(enrollment_rest::exit))
        .route("/v1/enrollments/:id/logs", get(enrollment_rest::logs))
        // Operational endpoints
        .route("/health", get(rest::health_check))
        .route("/live", get(rest::liveness))
        // Middleware
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub struct ApiServer {
    config: AppConfig,
    state: AppState,
}

impl ApiServer {
    pub fn new(config: AppConfig, state: AppState) -> Self {
        Self { config, state }
    }

    /// Serves HTTP until `shutdown` resolves.
    pub async fn start_http<F>(&self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let app = router(self.state.clone());
        let addr = SocketAddr::new(self.config.api.host.parse()?, self.config.api.http_port);

        info!(addr = %addr, "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("HTTP server stopped");
        Ok(())
    }

    /// Start the metrics server on a separate port.
    pub fn start_metrics(&self) -> anyhow::Result<()> {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(SocketAddr::new(
                self.config.api.host.parse()?,
                self.config.metrics.port,
            ))
            .install()?;

        info!(port = self.config.metrics.port, "Metrics exporter started");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::{TimeZone, Utc};
    use clinicflow_scenario::clock::ManualClock;
    use clinicflow_scenario::providers::{InMemoryAttributeProvider, RecordingActionExecutor};
    use clinicflow_scenario::{EngineContext, ScenarioEngine};
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use uuid::Uuid;

    fn app() -> (Router, ScenarioEngine) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 8, 3, 9, 0, 0).unwrap(),
        ));
        let ctx = EngineContext::new(
            Arc::new(InMemoryAttributeProvider::new(clock.clone())),
            Arc::new(RecordingActionExecutor::new()),
        )
        .with_clock(clock);
        let engine = ScenarioEngine::new(ctx);
        (router(AppState::new(engine.clone(), "test-node")), engine)
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let request = match body {
            Some(b) => builder.body(Body::from(b.to_string())).unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn welcome(id: Uuid) -> Value {
        json!({
            "id": id,
            "name": "Welcome",
            "trigger": { "type": "follow" },
            "steps": [
                { "step_order": 0, "delay": { "unit": "minutes", "value": 0 },
                  "action": { "kind": "send_message", "content": "Hi" } },
                { "step_order": 1, "delay": { "unit": "days", "value": 1 },
                  "action": { "kind": "send_message", "content": "Day1" } }
            ]
        })
    }

    #[tokio::test]
    async fn health_reports_node() {
        let (app, _) = app();
        let (status, body) = call(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["node_id"], "test-node");
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn save_and_fetch_scenario() {
        let (app, _) = app();
        let id = Uuid::new_v4();
        let (status, body) = call(&app, "POST", "/v1/scenarios", Some(welcome(id))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["version"], 1);

        let (status, body) = call(&app, "GET", &format!("/v1/scenarios/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "Welcome");

        let (status, body) = call(&app, "GET", "/v1/scenarios", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (status, _) = call(&app, "GET", &format!("/v1/scenarios/{}", Uuid::new_v4()), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unrecognised_entry_rule_is_returned_as_saved() {
        let (app, _) = app();
        let id = Uuid::new_v4();
        let custom = json!({ "type": "insurance_plan", "plan": "gold" });
        let mut scenario = welcome(id);
        scenario["entry_condition"] = json!({ "combinator": "AND", "rules": [custom.clone()] });
        let (status, _) = call(&app, "POST", "/v1/scenarios", Some(scenario)).await;
        assert_eq!(status, StatusCode::CREATED);

        let (_, body) = call(&app, "GET", &format!("/v1/scenarios/{id}"), None).await;
        assert_eq!(body["entry_condition"]["rules"][0], custom);
    }

    #[tokio::test]
    async fn oversized_delay_is_bad_request() {
        let (app, _) = app();
        let mut scenario = welcome(Uuid::new_v4());
        scenario["steps"][1]["delay"] = json!({ "unit": "days", "value": 4_000_000_000u64 });
        let (status, body) = call(&app, "POST", "/v1/scenarios", Some(scenario)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_definition");
    }

    #[tokio::test]
    async fn invalid_definition_is_bad_request() {
        let (app, _) = app();
        let mut scenario = welcome(Uuid::new_v4());
        scenario["steps"][0]["action"] = json!({
            "kind": "condition",
            "rule_set": { "combinator": "AND", "rules": [] },
            "on_true": 9
        });
        let (status, body) = call(&app, "POST", "/v1/scenarios", Some(scenario)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_definition");
    }

    #[tokio::test]
    async fn event_enrolls_and_lifecycle_endpoints_work() {
        let (app, _) = app();
        let id = Uuid::new_v4();
        call(&app, "POST", "/v1/scenarios", Some(welcome(id))).await;

        let (status, body) = call(
            &app,
            "POST",
            "/v1/events",
            Some(json!({ "type": "follow", "recipient_id": "friend-7" })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["count"], 1);
        let enrollment_id = body["enrollments"][0]["id"].as_str().unwrap().to_string();

        let uri = |suffix: &str| format!("/v1/enrollments/{enrollment_id}{suffix}");

        let (status, body) = call(&app, "POST", &uri("/pause"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "paused");

        let (status, body) = call(&app, "POST", &uri("/pause"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "invalid_transition");

        let (status, body) = call(&app, "POST", &uri("/resume"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "active");

        let (status, body) = call(&app, "POST", &uri("/exit"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "exited");

        let (status, body) = call(&app, "GET", &uri("/logs"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));

        let (status, body) = call(&app, "GET", &format!("/v1/scenarios/{id}/stats"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["exited"], 1);
    }

    #[tokio::test]
    async fn manual_enroll_conflicts_when_already_enrolled() {
        let (app, _) = app();
        let id = Uuid::new_v4();
        call(&app, "POST", "/v1/scenarios", Some(welcome(id))).await;

        let body = json!({ "recipient_id": "p-1" });
        let (status, _) = call(&app, "POST", &format!("/v1/scenarios/{id}/enroll"), Some(body.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, body) = call(&app, "POST", &format!("/v1/scenarios/{id}/enroll"), Some(body)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "already_enrolled");
    }

    #[tokio::test]
    async fn apply_to_all_and_stuck_listing() {
        let (app, engine) = app();
        let id = Uuid::new_v4();
        call(&app, "POST", "/v1/scenarios", Some(welcome(id))).await;

        let (status, body) = call(
            &app,
            "POST",
            &format!("/v1/scenarios/{id}/apply-to-all"),
            Some(json!({ "recipient_ids": ["a", "b"] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 2);
        assert_eq!(engine.enrollments_for_scenario(&id).len(), 2);

        // Due right now, so not yet stuck.
        let (status, body) = call(&app, "GET", "/v1/enrollments/stuck", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));
    }

    #[tokio::test]
    async fn unknown_enrollment_is_not_found() {
        let (app, _) = app();
        let (status, _) = call(&app, "GET", &format!("/v1/enrollments/{}", Uuid::new_v4()), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&app, "POST", &format!("/v1/enrollments/{}/pause", Uuid::new_v4()), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
