pub mod memory;
pub mod redis;

use std::sync::Arc;

use crate::config::Config;
use crate::publish::session::{SessionStore, SessionStoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Redis,
    Memory,
}

impl StoreBackend {
    pub fn from_env() -> Self {
        match std::env::var("SESSION_STORE_BACKEND").as_deref() {
            Ok("memory") => StoreBackend::Memory,
            _ => StoreBackend::Redis,
        }
    }
}

pub async fn create_session_store(
    config: &Config,
) -> Result<Arc<dyn SessionStore>, SessionStoreError> {
    match StoreBackend::from_env() {
        StoreBackend::Memory => {
            tracing::info!("Using in-memory session store");
            Ok(Arc::new(memory::MemorySessionStore::new(
                config.store.session_ttl,
            )))
        }
        StoreBackend::Redis => {
            let url = config.store.redis_url.as_deref().ok_or_else(|| {
                SessionStoreError::Backend("REDIS_URL is required for the redis backend".into())
            })?;
            tracing::info!("Connecting session store to redis");
            let store = redis::RedisSessionStore::connect(url, config.store.session_ttl).await?;
            Ok(Arc::new(store))
        }
    }
}
