use std::time::Duration;

use base64::Engine;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    MissingVar(&'static str),
    #[error("invalid value for {var}: {reason}")]
    InvalidVar { var: &'static str, reason: String },
}

fn required(var: &'static str) -> Result<String, ConfigError> {
    std::env::var(var).map_err(|_| ConfigError::MissingVar(var))
}

fn optional(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.is_empty())
}

fn seconds(var: &'static str, default: u64) -> Result<Duration, ConfigError> {
    match optional(var) {
        None => Ok(Duration::from_secs(default)),
        Some(raw) => raw
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| ConfigError::InvalidVar {
                var,
                reason: e.to_string(),
            }),
    }
}

/// Decodes an env var holding base64-encoded PEM. Raw PEM (starting with
/// "-----") is accepted as-is for local development.
fn pem_var(var: &'static str) -> Result<String, ConfigError> {
    let raw = required(var)?;
    if raw.trim_start().starts_with("-----") {
        return Ok(raw);
    }
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(raw.trim())
        .map_err(|e| ConfigError::InvalidVar {
            var,
            reason: e.to_string(),
        })?;
    String::from_utf8(bytes).map_err(|e| ConfigError::InvalidVar {
        var,
        reason: e.to_string(),
    })
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub redis_url: Option<String>,
    pub session_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// JWKS document of the interactive auth provider.
    pub jwks_url: String,
    pub issuer: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OidcConfig {
    pub issuer: String,
    pub audience: String,
    pub jwks_url: String,
    pub refresh_interval: Duration,
    pub fetch_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CombinedTokenConfig {
    pub signing_key_pem: String,
    pub public_key_pem: String,
    pub kid: String,
    pub issuer: String,
    pub audience: String,
    pub ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub api_base: String,
    pub repository: String,
    pub workflow_file: String,
    pub git_ref: String,
    pub token: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub store: StoreConfig,
    pub auth: AuthConfig,
    pub oidc: OidcConfig,
    pub combined: CombinedTokenConfig,
    pub dispatch: DispatchSettings,
    pub webhook_secret: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let oidc_issuer = optional("CI_OIDC_ISSUER")
            .unwrap_or_else(|| "https://token.actions.githubusercontent.com".to_string());
        let oidc_jwks_url = optional("CI_OIDC_JWKS_URL")
            .unwrap_or_else(|| format!("{}/.well-known/jwks", oidc_issuer.trim_end_matches('/')));

        Ok(Self {
            store: StoreConfig {
                redis_url: optional("REDIS_URL"),
                session_ttl: seconds("PUBLISH_SESSION_TTL_SECONDS", 3600)?,
            },
            auth: AuthConfig {
                jwks_url: required("AUTH_JWKS_URL")?,
                issuer: optional("AUTH_ISSUER"),
            },
            oidc: OidcConfig {
                issuer: oidc_issuer,
                audience: required("CI_OIDC_AUDIENCE")?,
                jwks_url: oidc_jwks_url,
                refresh_interval: seconds("CI_OIDC_JWKS_REFRESH_SECONDS", 30)?,
                fetch_timeout: seconds("CI_OIDC_JWKS_TIMEOUT_SECONDS", 5)?,
            },
            combined: CombinedTokenConfig {
                signing_key_pem: pem_var("COMBINED_TOKEN_KEY")?,
                public_key_pem: pem_var("COMBINED_TOKEN_PUB")?,
                kid: optional("COMBINED_TOKEN_KID").unwrap_or_else(|| "bindery-1".to_string()),
                issuer: optional("COMBINED_TOKEN_ISSUER")
                    .unwrap_or_else(|| "bindery".to_string()),
                audience: optional("COMBINED_TOKEN_AUDIENCE")
                    .unwrap_or_else(|| "bindery-runner".to_string()),
                ttl: seconds("COMBINED_TOKEN_TTL_SECONDS", 900)?,
            },
            dispatch: DispatchSettings {
                api_base: optional("CI_API_BASE")
                    .unwrap_or_else(|| "https://api.github.com".to_string()),
                repository: required("CI_REPOSITORY")?,
                workflow_file: optional("CI_WORKFLOW_FILE")
                    .unwrap_or_else(|| "publish.yml".to_string()),
                git_ref: optional("CI_WORKFLOW_REF").unwrap_or_else(|| "main".to_string()),
                token: required("CI_DISPATCH_TOKEN")?,
                timeout: seconds("CI_DISPATCH_TIMEOUT_SECONDS", 10)?,
            },
            webhook_secret: required("WEBHOOK_SECRET")?,
        })
    }
}
