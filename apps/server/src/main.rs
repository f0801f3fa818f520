mod config;

use std::sync::Arc;

use bindery_api::config::Config;
use bindery_api::publish::store::create_session_store;
use bindery_api::state::{State, fetch_auth_jwks};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let server_config = config::ServerConfig::from_env()?;
    let config = Config::from_env()?;

    let store = create_session_store(&config).await?;
    let jwks = fetch_auth_jwks(&config).await?;
    let state = Arc::new(State::new(config, jwks, store)?);

    let router = bindery_api::construct_router(state);

    let addr = server_config.bind_addr();
    tracing::info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
