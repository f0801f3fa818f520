use axum::{Json, Router, extract::State, routing::get};
use serde_json::{Value, json};

use crate::error::ApiError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/health/store", get(health_store))
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service is alive"))
)]
#[tracing::instrument(name = "GET /health")]
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[utoipa::path(
    get,
    path = "/health/store",
    responses(
        (status = 200, description = "Session store reachable"),
        (status = 500, description = "Session store unreachable")
    )
)]
#[tracing::instrument(name = "GET /health/store", skip(state))]
pub async fn health_store(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let started = std::time::Instant::now();
    state.sessions.ping_store().await?;
    Ok(Json(json!({
        "status": "ok",
        "rtt_ms": started.elapsed().as_millis() as u64,
    })))
}
