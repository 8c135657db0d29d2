use crate::state::AppState;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router, http::StatusCode, routing::get};

pub async fn liveness_probe() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

/// Ready once the first reconciliation pass has completed.
pub async fn readiness_probe(State(state): State<AppState>) -> StatusCode {
    match state.last_pass().await {
        Some(_) => StatusCode::NO_CONTENT,
        None => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// The report of the most recent pass as JSON.
pub async fn last_pass(State(state): State<AppState>) -> Response {
    match state.last_pass().await {
        Some(report) => Json(report).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/health/live", get(liveness_probe))
        .route("/health/ready", get(readiness_probe))
        .route("/status", get(last_pass))
        .with_state(state)
}
