use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use crate::error::ApiError;
use crate::state::AppState;

/// Who is calling. Interactive clients are authenticated here; runner
/// callbacks authenticate themselves at the route boundary instead.
#[derive(Debug, Clone)]
pub enum AuthPrincipal {
    Interactive { sub: String },
    Unauthorized,
}

impl AuthPrincipal {
    pub fn sub(&self) -> Result<&str, ApiError> {
        match self {
            AuthPrincipal::Interactive { sub } => Ok(sub),
            AuthPrincipal::Unauthorized => Err(ApiError::UNAUTHORIZED),
        }
    }
}

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let principal = principal_from_request(&state, &request);
    request.extensions_mut().insert(principal);
    next.run(request).await
}

fn principal_from_request(state: &AppState, request: &Request) -> AuthPrincipal {
    let Some(token) = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    else {
        return AuthPrincipal::Unauthorized;
    };

    match state.validate_token(token) {
        Ok(claims) => match claims.get("sub").and_then(|v| v.as_str()) {
            Some(sub) => AuthPrincipal::Interactive {
                sub: sub.to_string(),
            },
            None => AuthPrincipal::Unauthorized,
        },
        Err(err) => {
            tracing::debug!("Interactive token rejected: {:?}", err);
            AuthPrincipal::Unauthorized
        }
    }
}
