//! HTTP and WebSocket routes for the overseer
//!
//! The dashboard backend drives the worker through `/api/process/*` and reads
//! logs through `/api/logs/*` and host usage through `/api/system`; browsers
//! stream live logs over `/ws/logs`.

use axum::extract::State;
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub mod logs;
pub mod process;
pub mod sessions;
pub mod system;
pub mod websocket_logs;

use crate::actors::event_bus::BusError;
use crate::actors::process_supervisor::SupervisorError;
use crate::app_state::AppState;

#[derive(Clone)]
pub struct ApiState {
    pub app_state: Arc<AppState>,
}

/// Configure all API routes
pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/health", get(health_check))
        // Process control
        .route("/api/process/status", get(process::get_status))
        .route("/api/process/start", post(process::start))
        .route("/api/process/stop", post(process::stop))
        .route("/api/process/restart", post(process::restart))
        // Logs
        .route("/api/logs/recent", get(logs::get_recent))
        .route("/api/logs/stats", get(logs::get_stats))
        .route("/api/sessions", get(sessions::list_sessions))
        .route("/api/system", get(system::get_system))
        .route("/ws/logs", get(websocket_logs::logs_websocket))
}

/// Router with state and the HTTP layers applied.
pub fn app(app_state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
        .max_age(std::time::Duration::from_secs(3600));

    router()
        .with_state(ApiState { app_state })
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Health check endpoint
pub async fn health_check(State(state): State<ApiState>) -> impl IntoResponse {
    let worker = state.app_state.supervisor().status();
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "overseer",
            "version": env!("CARGO_PKG_VERSION"),
            "worker_state": worker.state,
            "viewers": state.app_state.sessions().len(),
        })),
    )
}

/// JSON error body `{ "error": ... }` with a status derived from the cause.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<SupervisorError> for ApiError {
    fn from(e: SupervisorError) -> Self {
        let status = match &e {
            SupervisorError::IllegalState { .. } => StatusCode::CONFLICT,
            SupervisorError::Spawn(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SupervisorError::ExitedDuringStartup { .. } => StatusCode::BAD_GATEWAY,
            SupervisorError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self::new(status, e.to_string())
    }
}

impl From<BusError> for ApiError {
    fn from(e: BusError) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
    }
}
