use std::collections::HashMap;
use std::sync::Arc;

use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Validation, decode};
use serde_json::Value;

use crate::config::Config;
use crate::publish::{PublishSessions, SessionStore, WorkflowDispatcher};
use crate::token::combined::CombinedTokens;
use crate::token::oidc::CiOidcVerifier;
use crate::token::{TokenError, decoding_key_for_algorithm};

pub type AppState = Arc<State>;

pub struct State {
    pub config: Config,
    /// Key set of the interactive auth provider.
    pub jwks: JwkSet,
    pub sessions: Arc<PublishSessions>,
    pub combined_tokens: CombinedTokens,
    pub oidc: CiOidcVerifier,
    pub dispatcher: WorkflowDispatcher,
}

impl State {
    /// Assembles the process state. The store handle is passed in explicitly
    /// so tests and the binary construct it once and own its lifecycle.
    pub fn new(
        config: Config,
        jwks: JwkSet,
        store: Arc<dyn SessionStore>,
    ) -> Result<Self, crate::error::ApiError> {
        let combined_tokens = CombinedTokens::new(&config.combined)?;
        let oidc = CiOidcVerifier::new(&config.oidc)?;
        let dispatcher = WorkflowDispatcher::new(config.dispatch.clone())?;
        Ok(Self {
            config,
            jwks,
            sessions: Arc::new(PublishSessions::new(store)),
            combined_tokens,
            oidc,
            dispatcher,
        })
    }

    /// Validates an interactive bearer token against the provider JWKS and
    /// returns its claims.
    pub fn validate_token(&self, token: &str) -> Result<HashMap<String, Value>, TokenError> {
        let header = jsonwebtoken::decode_header(token).map_err(|_| TokenError::Malformed)?;
        let kid = header.kid.ok_or(TokenError::Malformed)?;
        let jwk = self.jwks.find(&kid).ok_or(TokenError::UnknownKey)?;
        let key = decoding_key_for_algorithm(&jwk.algorithm)?;
        let mut validation = Validation::new(header.alg);
        validation.validate_aud = false;
        if let Some(issuer) = &self.config.auth.issuer {
            validation.set_issuer(&[issuer]);
        }
        let decoded = decode::<HashMap<String, Value>>(token, &key, &validation)
            .map_err(TokenError::Validation)?;
        Ok(decoded.claims)
    }
}

/// Fetches the interactive auth provider's JWKS once at startup.
pub async fn fetch_auth_jwks(config: &Config) -> Result<JwkSet, TokenError> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()
        .map_err(|e| TokenError::Fetch(e.to_string()))?;
    client
        .get(&config.auth.jwks_url)
        .send()
        .await
        .map_err(|e| TokenError::Fetch(e.to_string()))?
        .error_for_status()
        .map_err(|e| TokenError::Fetch(e.to_string()))?
        .json()
        .await
        .map_err(|e| TokenError::Fetch(e.to_string()))
}
