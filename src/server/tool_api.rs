//! Tool-call HTTP API.
//!
//! - POST /v1/tools/call
//! - POST /v1/tools/call/stream
//! - GET /v1/engine/stats
//! - GET /health
//! - GET /metrics

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::store::CacheStats;
use crate::config::Config;
use crate::engine::operation::{CallContext, Operation, OperationOutput};
use crate::engine::{Engine, EngineStats};
use crate::error::{EngineError, ErrorBody};
use crate::metrics::PrometheusMetrics;
use crate::server::streaming::operation_to_sse_stream;

/// Header carrying the caller's session id.
pub const SESSION_HEADER: &str = "x-session-id";

/// Application state shared across handlers.
pub struct AppState {
    pub engine: Arc<Engine>,
    pub metrics: Arc<PrometheusMetrics>,
    pub config: Arc<Config>,
    pub start_time: Instant,
}

/// Build the axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    let permissive_cors = state.config.server.permissive_cors;
    let router = Router::new()
        .route("/v1/tools/call", post(call_tool))
        .route("/v1/tools/call/stream", post(call_tool_stream))
        .route("/v1/engine/stats", get(engine_stats))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if permissive_cors {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

// ─── Errors ────────────────────────────────────────────────────────────────

/// An engine error rendered as a JSON body with a mapped status.
pub struct ApiError(pub EngineError);

pub fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::InvalidRange { .. } | EngineError::CursorInvalid { .. } => StatusCode::BAD_REQUEST,
        EngineError::PageOutOfRange { .. } => StatusCode::NOT_FOUND,
        EngineError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        EngineError::PartialBatchFailure { .. } | EngineError::UpstreamFailure { .. } => StatusCode::BAD_GATEWAY,
        EngineError::UpstreamTimeout { .. } | EngineError::BatchWindowTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        EngineError::Shutdown { .. } => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            warn!(code = self.0.code(), error = %self.0, "Tool call failed");
        }
        (status, Json(ErrorBody::from(&self.0))).into_response()
    }
}

// ─── Response Types ────────────────────────────────────────────────────────

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub cache: CacheStats,
    pub cache_utilization: f64,
}

// ─── Route Handlers ────────────────────────────────────────────────────────

fn session_from(headers: &HeaderMap) -> String {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn op_name(op: &Operation) -> &'static str {
    match op {
        Operation::Read(_) => "read",
        Operation::Write(_) => "write",
        Operation::BatchRead(_) => "batch_read",
    }
}

async fn call_tool(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(op): Json<Operation>,
) -> Result<Json<OperationOutput>, ApiError> {
    let session_id = session_from(&headers);
    info!(
        session_id = %session_id,
        op = op_name(&op),
        resource_id = op.resource_id(),
        "Tool call"
    );

    let ctx = CallContext::new(session_id);
    let output = state.engine.execute(op, &ctx).await.map_err(ApiError)?;
    Ok(Json(output))
}

async fn call_tool_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(op): Json<Operation>,
) -> impl IntoResponse {
    let session_id = session_from(&headers);
    info!(
        session_id = %session_id,
        op = op_name(&op),
        resource_id = op.resource_id(),
        "Streaming tool call"
    );

    let stream = operation_to_sse_stream(Arc::clone(&state.engine), op, session_id);
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn engine_stats(State(state): State<Arc<AppState>>) -> Json<EngineStats> {
    Json(state.engine.stats())
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let cache = state.engine.stats().cache;
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        cache_utilization: cache.usage_fraction(),
        cache,
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.render() {
        Ok(body) => ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        Err(err) => {
            warn!(error = %err, "Failed to render metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
