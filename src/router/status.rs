//! Public status and metrics pages.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Serialize;

use crate::AppState;

/// Structured configuration.
#[derive(Serialize)]
pub struct Status {
    name: String,
    version: String,
    url: String,
    generator: bool,
}

/// Public server status (configuration).
pub async fn status(State(state): State<AppState>) -> Json<Status> {
    Json(Status {
        name: state.config.name.clone(),
        version: state.config.version().to_owned(),
        url: state.config.url.clone(),
        generator: state.config.generator.enabled,
    })
}

/// Prometheus exposition, when a recorder is installed.
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, String::new()),
    }
}
