pub mod session;
pub mod update;

use axum::{
    Router,
    routing::{get, post},
};

use crate::state::AppState;

/// Interactive endpoints; registered behind the bearer auth middleware.
pub fn session_routes() -> Router<AppState> {
    Router::new()
        .route("/sessions", post(session::create_session))
        .route("/sessions/{id}/status", get(session::get_status))
        .route("/sessions/combined-token", get(session::combined_token))
}

/// Runner-facing endpoints; handlers authenticate the caller themselves.
pub fn callback_routes() -> Router<AppState> {
    Router::new()
        .route("/sessions/update", post(update::update_session))
        .route("/sessions/attest", post(update::attest))
        .route("/.well-known/jwks.json", get(session::publish_jwks))
}
