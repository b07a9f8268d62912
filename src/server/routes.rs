//! Axum route handlers for the capability server.
//!
//! # Routes
//!
//! - `GET  /health`                       — Liveness probe
//! - `GET  /capabilities`                 — One summary per registered name
//! - `GET  /capabilities/:name/versions`  — Every version of one capability
//! - `POST /execute`                      — Run an `ExecutionRequest`
//! - `POST /run/:name`                    — Run the latest version with the body as input
//! - `GET  /approvals`                    — Pending approvals
//! - `POST /approvals/:id/approve`        — Approve a pending request
//! - `POST /approvals/:id/reject`         — Reject a pending request
//! - `GET  /stats`                        — Engine statistics
//! - `GET  /metrics/:name?days=`          — Per-capability ledger summary
//! - `GET  /metrics/:name/roi?hours_saved=&hourly_rate=`
//! - `GET  /ledger/export?format=json|csv`
//! - `GET  /alerts?limit=`                — Recent threshold alerts, newest first

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::coordinator::{ExecutionCoordinator, ExecutionRequest};
use crate::executor::{ErrorCode, ExecutionFailure};
use crate::ledger::ExportFormat;

type ApiError = (StatusCode, Json<Value>);

/// Shared application state for the HTTP server.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<ExecutionCoordinator>,
}

impl AppState {
    pub fn new(coordinator: Arc<ExecutionCoordinator>) -> Self {
        Self { coordinator }
    }
}

/// Build the axum router with all routes.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/capabilities", get(list_capabilities_handler))
        .route("/capabilities/:name/versions", get(list_versions_handler))
        .route("/execute", post(execute_handler))
        .route("/run/:name", post(run_handler))
        .route("/approvals", get(list_approvals_handler))
        .route("/approvals/:id/approve", post(approve_handler))
        .route("/approvals/:id/reject", post(reject_handler))
        .route("/stats", get(stats_handler))
        .route("/metrics/:name", get(skill_metrics_handler))
        .route("/metrics/:name/roi", get(roi_handler))
        .route("/ledger/export", get(export_handler))
        .route("/alerts", get(alerts_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// HTTP status for a failed execution.
pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::CapabilityNotFound => StatusCode::NOT_FOUND,
        ErrorCode::InvalidVersionRange | ErrorCode::ValidationFailed => StatusCode::BAD_REQUEST,
        ErrorCode::DependencyMissing => StatusCode::FAILED_DEPENDENCY,
        ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::ApprovalRejected => StatusCode::FORBIDDEN,
        ErrorCode::ApprovalTimeout => StatusCode::REQUEST_TIMEOUT,
        ErrorCode::DuplicateRequest => StatusCode::CONFLICT,
        ErrorCode::CircuitOpen => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::ExecutionTimeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorCode::OutputValidationFailed
        | ErrorCode::CapabilityFailed
        | ErrorCode::CapabilityPanicked
        | ErrorCode::SnapshotFailed => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn failure_response(failure: &ExecutionFailure) -> ApiError {
    (
        status_for(failure.code),
        Json(json!({
            "error": failure.message,
            "code": failure.code,
        })),
    )
}

fn not_found(message: String) -> ApiError {
    (StatusCode::NOT_FOUND, Json(json!({ "error": message })))
}

/// GET /health — liveness probe.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": crate::VERSION,
        "service": "capability-engine",
    }))
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

async fn list_capabilities_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "capabilities": state.coordinator.list_capabilities() }))
}

async fn list_versions_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let versions = state.coordinator.list_versions(&name);
    if versions.is_empty() {
        return Err(not_found(format!("Capability '{}' not found", name)));
    }
    Ok(Json(json!({ "name": name, "versions": versions })))
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// POST /execute — run a full request.
///
/// The body is an `ExecutionRequest`; `id`, `mode` and `requesting_actor`
/// default when omitted. The response is always the `ExecutionResult`, with
/// a status derived from its error code.
async fn execute_handler(
    State(state): State<AppState>,
    Json(request): Json<ExecutionRequest>,
) -> Response {
    let result = state.coordinator.execute(request).await;
    let status = result
        .error
        .as_ref()
        .map(|e| status_for(e.code))
        .unwrap_or(StatusCode::OK);
    (status, Json(result)).into_response()
}

/// POST /run/:name — latest version, production mode, body as input.
async fn run_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Option<Json<Value>>,
) -> Result<Json<Value>, ApiError> {
    let input = body.map(|Json(v)| v).unwrap_or_else(|| json!({}));
    let output = state
        .coordinator
        .run(&name, input)
        .await
        .map_err(|e| failure_response(&e))?;
    Ok(Json(json!({ "capability": name, "output": output })))
}

// ---------------------------------------------------------------------------
// Approvals
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RejectBody {
    #[serde(default)]
    reason: Option<String>,
}

async fn list_approvals_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "pending": state.coordinator.pending_approvals() }))
}

async fn approve_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !state.coordinator.approve(&id) {
        return Err(not_found(format!("No pending approval '{}'", id)));
    }
    Ok(Json(json!({ "request_id": id, "decision": "approved" })))
}

async fn reject_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<RejectBody>>,
) -> Result<Json<Value>, ApiError> {
    let reason = body.and_then(|Json(b)| b.reason);
    if !state.coordinator.reject(&id, reason.as_deref()) {
        return Err(not_found(format!("No pending approval '{}'", id)));
    }
    Ok(Json(json!({ "request_id": id, "decision": "rejected" })))
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct MetricsQuery {
    #[serde(default = "default_days")]
    days: u32,
}

fn default_days() -> u32 {
    7
}

#[derive(Debug, Deserialize)]
struct AlertsQuery {
    #[serde(default = "default_alert_limit")]
    limit: usize,
}

fn default_alert_limit() -> usize {
    20
}

#[derive(Debug, Deserialize)]
struct RoiQuery {
    hours_saved: f64,
    hourly_rate: f64,
}

#[derive(Debug, Deserialize)]
struct ExportQuery {
    #[serde(default)]
    format: Option<String>,
}

async fn stats_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.coordinator.get_stats()))
}

async fn alerts_handler(
    State(state): State<AppState>,
    Query(query): Query<AlertsQuery>,
) -> Json<Value> {
    Json(json!({ "alerts": state.coordinator.recent_alerts(query.limit) }))
}

async fn skill_metrics_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<MetricsQuery>,
) -> Json<Value> {
    Json(json!(state.coordinator.get_skill_metrics(&name, query.days)))
}

async fn roi_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<RoiQuery>,
) -> Json<Value> {
    Json(json!(state
        .coordinator
        .calculate_roi(&name, query.hours_saved, query.hourly_rate)))
}

async fn export_handler(
    State(state): State<AppState>,
    Query(query): Query<ExportQuery>,
) -> Result<Response, ApiError> {
    let format = match query.format.as_deref() {
        Some(raw) => raw
            .parse::<ExportFormat>()
            .map_err(|e| (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))))?,
        None => ExportFormat::default(),
    };
    let body = state.coordinator.export_metrics(format).map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
    })?;
    let content_type = match format {
        ExportFormat::Json => "application/json",
        ExportFormat::Csv => "text/csv",
    };
    Ok(([(header::CONTENT_TYPE, content_type)], body).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::capabilities::EchoCapability;
    use crate::context::EngineContext;

    fn test_state() -> AppState {
        let engine = Arc::new(EngineContext::with_defaults());
        engine
            .registry
            .register(EchoCapability::spec(), Arc::new(EchoCapability))
            .unwrap();
        AppState::new(Arc::new(ExecutionCoordinator::new(engine)))
    }

    async fn body_json(response: Response) -> Value {
        let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = app_router(test_state());

        let response = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["version"], crate::VERSION);
        assert_eq!(json["service"], "capability-engine");
    }

    #[tokio::test]
    async fn test_list_capabilities_and_versions() {
        let state = test_state();

        let response = app_router(state.clone())
            .oneshot(get("/capabilities"))
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["capabilities"][0]["name"], EchoCapability::NAME);

        let response = app_router(state.clone())
            .oneshot(get("/capabilities/system.echo/versions"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["versions"].as_array().unwrap().len(), 1);

        let response = app_router(state)
            .oneshot(get("/capabilities/nope/versions"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_execute_echo() {
        let app = app_router(test_state());

        let request = post_json(
            "/execute",
            json!({
                "capability": "system.echo",
                "version": "^1.0.0",
                "input": { "msg": "hi" },
            }),
        );
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["stage"], "done");
        assert_eq!(json["output"]["echo"]["msg"], "hi");
    }

    #[tokio::test]
    async fn test_execute_unknown_capability_is_404() {
        let app = app_router(test_state());

        let response = app
            .oneshot(post_json("/execute", json!({ "capability": "ghost" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], "capability_not_found");
    }

    #[tokio::test]
    async fn test_run_returns_output() {
        let app = app_router(test_state());

        let response = app
            .oneshot(post_json("/run/system.echo", json!({ "n": 3 })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["output"]["echo"]["n"], 3);
    }

    #[tokio::test]
    async fn test_unknown_approval_is_404() {
        let state = test_state();

        let response = app_router(state.clone())
            .oneshot(post_json("/approvals/missing/approve", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app_router(state.clone())
            .oneshot(post_json(
                "/approvals/missing/reject",
                json!({ "reason": "no" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app_router(state).oneshot(get("/approvals")).await.unwrap();
        let json = body_json(response).await;
        assert_eq!(json["pending"], json!([]));
    }

    #[tokio::test]
    async fn test_stats_metrics_and_export() {
        let state = test_state();
        state
            .coordinator
            .run(EchoCapability::NAME, json!({}))
            .await
            .unwrap();

        let response = app_router(state.clone()).oneshot(get("/stats")).await.unwrap();
        let json = body_json(response).await;
        assert_eq!(json["executions"]["total"], 1);
        assert_eq!(json["capabilities"], 1);

        let response = app_router(state.clone())
            .oneshot(get("/metrics/system.echo?days=1"))
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["total_executions"], 1);

        let response = app_router(state.clone())
            .oneshot(get("/metrics/system.echo?days=4294967295"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["total_executions"], 1);

        let response = app_router(state.clone())
            .oneshot(get("/metrics/system.echo/roi?hours_saved=0.5&hourly_rate=40"))
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["value_generated"], 20.0);

        let response = app_router(state.clone())
            .oneshot(get("/ledger/export?format=csv"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/csv"
        );

        let response = app_router(state)
            .oneshot(get("/ledger/export?format=xml"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_alerts_endpoint_lists_newest_first() {
        let state = test_state();
        let alerts = &state.coordinator.engine().resilience.alerts;
        for _ in 0..5 {
            alerts.observe("system.echo", false, None);
        }
        for _ in 0..5 {
            alerts.observe("files.read", false, None);
        }

        let response = app_router(state.clone()).oneshot(get("/alerts")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["alerts"].as_array().unwrap().len(), 2);
        assert_eq!(json["alerts"][0]["capability"], "files.read");
        assert_eq!(json["alerts"][0]["kind"], "failure_rate");
        assert_eq!(json["alerts"][0]["level"], "critical");

        let response = app_router(state).oneshot(get("/alerts?limit=1")).await.unwrap();
        let json = body_json(response).await;
        assert_eq!(json["alerts"].as_array().unwrap().len(), 1);
    }
}
