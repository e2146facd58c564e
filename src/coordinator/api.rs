#![forbid(unsafe_code)]

// HTTP control surface for the coordinator

use crate::auth::{self, AuthError};
use crate::coordinator::{Coordinator, CoordinatorError, ProvisionReport};
use crate::coordinator::registry::CoordinatorSnapshot;
use crate::run::{RunSummary, TestConfig};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[derive(Clone)]
pub struct ControlState {
    coordinator: Arc<Coordinator>,
    token: Arc<str>,
}

impl ControlState {
    pub fn new(coordinator: Arc<Coordinator>, token: impl Into<Arc<str>>) -> Self {
        Self { coordinator, token: token.into() }
    }

    fn authorize(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        auth::authorize(headers, &self.token).map_err(ApiError::Auth)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub uri: Option<String>,
    pub workers: usize,
    pub files: usize,
    /// Upper bound, in ms, of each worker's random start delay
    pub start_within: u64,
}

#[derive(Debug, Deserialize)]
pub struct StopRequest {
    pub workers: usize,
}

#[derive(Debug, Serialize)]
pub struct StopResponse {
    pub stopped: usize,
}

#[derive(Debug)]
pub enum ApiError {
    Auth(AuthError),
    Coordinator(CoordinatorError),
    BadRequest(String),
}

impl From<CoordinatorError> for ApiError {
    fn from(err: CoordinatorError) -> Self {
        ApiError::Coordinator(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Auth(e) => return e.into_response(),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Coordinator(e) => {
                let status = match e {
                    CoordinatorError::Conflict(_) => StatusCode::CONFLICT,
                    CoordinatorError::NotFound(_) => StatusCode::NOT_FOUND,
                    CoordinatorError::Invalid(_) => StatusCode::BAD_REQUEST,
                };
                (status, e.to_string())
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// The control client posts JSON without a content type, so bodies are
/// decoded from raw bytes instead of through the `Json` extractor.
fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("Invalid body: {e}")))
}

pub fn router(state: ControlState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/state", get(state_handler))
        .route("/reset", get(reset_handler))
        .route("/:test_id/start", post(start_handler))
        .route("/:test_id/stop", post(stop_handler))
        .route("/:test_id/summary", get(summary_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Binds `0.0.0.0:{port}` and serves the control API until the future is dropped.
pub async fn serve(state: ControlState, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{port}");
    info!("Starting control API on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router(state)).await?;

    Ok(())
}

/// POST /:test_id/start
async fn start_handler(
    State(state): State<ControlState>,
    Path(test_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ProvisionReport>, ApiError> {
    state.authorize(&headers)?;
    let request: StartRequest = parse_body(&body)?;

    let config = TestConfig {
        worker_count: request.workers,
        file_count: request.files,
        start_within_ms: request.start_within,
        target_uri: request
            .uri
            .filter(|uri| !uri.is_empty())
            .unwrap_or_else(|| state.coordinator.default_origin().to_string()),
    };
    let report = state.coordinator.start_test(&test_id, config).await.map_err(|e| {
        warn!("Start of {} refused: {}", test_id, e);
        e
    })?;
    Ok(Json(report))
}

/// POST /:test_id/stop
async fn stop_handler(
    State(state): State<ControlState>,
    Path(test_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<StopResponse>, ApiError> {
    state.authorize(&headers)?;
    let request: StopRequest = parse_body(&body)?;
    let stopped = state.coordinator.stop_test(&test_id, request.workers).await;
    Ok(Json(StopResponse { stopped }))
}

/// GET /:test_id/summary
async fn summary_handler(
    State(state): State<ControlState>,
    Path(test_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<RunSummary>, ApiError> {
    state.authorize(&headers)?;
    Ok(Json(state.coordinator.summary(&test_id)?))
}

/// GET /reset
async fn reset_handler(
    State(state): State<ControlState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.authorize(&headers)?;
    state.coordinator.reset();
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

/// GET /state
async fn state_handler(
    State(state): State<ControlState>,
    headers: HeaderMap,
) -> Result<Json<CoordinatorSnapshot>, ApiError> {
    state.authorize(&headers)?;
    Ok(Json(state.coordinator.snapshot()))
}

async fn health_handler(State(state): State<ControlState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "tests": state.coordinator.tests_active(),
        "workers": state.coordinator.workers_live(),
    }))
}

/// Metrics handler, Prometheus text exposition format.
async fn metrics_handler(
    State(state): State<ControlState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    state.authorize(&headers)?;
    let coordinator = &state.coordinator;
    let body = coordinator
        .metrics()
        .render_prometheus(coordinator.tests_active(), coordinator.workers_live());
    Ok((
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response())
}
