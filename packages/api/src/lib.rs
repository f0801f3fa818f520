pub mod config;
pub mod error;
pub mod middleware;
pub mod openapi;
pub mod publish;
pub mod routes;
pub mod state;
pub mod token;

use axum::{
    Json, Router,
    routing::{get, post},
};
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer, cors::CorsLayer, decompression::RequestDecompressionLayer,
};
use utoipa::OpenApi;

use crate::state::AppState;

pub use crate::error::ApiError;
pub use crate::middleware::auth::AuthPrincipal;

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(openapi::ApiDoc::openapi())
}

/// Builds the full API router. Interactive routes sit behind the bearer
/// middleware; runner callbacks and the webhook authenticate per request.
pub fn construct_router(state: AppState) -> Router {
    let interactive = Router::new()
        .nest("/publish", routes::publish::session_routes())
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::auth::auth_middleware,
        ));

    let open = Router::new()
        .nest("/publish", routes::publish::callback_routes())
        .route("/webhook/ci", post(routes::webhook::ci_webhook))
        .route("/openapi.json", get(openapi_json))
        .merge(routes::health::routes());

    Router::new()
        .nest("/api/v1", interactive.merge(open))
        .layer(
            ServiceBuilder::new()
                .layer(CorsLayer::permissive())
                .layer(RequestDecompressionLayer::new())
                .layer(CompressionLayer::new()),
        )
        .with_state(state)
}
