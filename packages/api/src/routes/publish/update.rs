use axum::{Json, extract::State, http::HeaderMap};
use serde::Deserialize;
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::publish::{PublishErrorInfo, PublishResult, RunnerInfo};
use crate::state::AppState;
use crate::token::combined::{CombinedClaims, SCOPE_PUBLISH_UPDATE};
use crate::token::oidc::CiClaims;

use super::session::SessionView;

/// An authenticated runner callback. OIDC is the primary path; the combined
/// token covers runner steps that cannot mint an OIDC token.
pub enum RunnerContext {
    Oidc(CiClaims),
    Combined(CombinedClaims),
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::unauthorized("Missing bearer token"))
}

pub async fn authenticate_runner(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<RunnerContext, ApiError> {
    let token = extract_bearer_token(headers)?;

    match state.oidc.verify(token).await {
        Ok(claims) => return Ok(RunnerContext::Oidc(claims)),
        Err(err) => tracing::debug!("OIDC verification failed, trying combined token: {:?}", err),
    }

    let claims = state.combined_tokens.verify(token)?;
    if !claims.has_scope(SCOPE_PUBLISH_UPDATE) {
        return Err(ApiError::unauthorized("Invalid token"));
    }
    Ok(RunnerContext::Combined(claims))
}

/// Resolves which session a runner may touch. The session id always comes
/// from the credential, never from the request body.
async fn session_for_runner(state: &AppState, context: &RunnerContext) -> Result<String, ApiError> {
    match context {
        RunnerContext::Combined(claims) => Ok(claims.sid.clone()),
        RunnerContext::Oidc(claims) => state
            .sessions
            .session_for_run(&claims.run_id)
            .await?
            .ok_or_else(|| ApiError::unauthorized("Run is not bound to a session")),
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AttestRequest {
    pub session_id: String,
    #[serde(default)]
    pub run_id: Option<String>,
}

#[tracing::instrument(name = "POST /publish/sessions/attest", skip(state, headers, payload))]
pub async fn attest(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<AttestRequest>,
) -> Result<Json<SessionView>, ApiError> {
    let token = extract_bearer_token(&headers)?;
    let claims = state.oidc.verify(token).await?;

    if claims.repository != state.config.dispatch.repository {
        tracing::warn!(repository = %claims.repository, "Attestation from foreign repository");
        return Err(ApiError::unauthorized("Invalid token"));
    }
    if let Some(run_id) = &payload.run_id {
        if run_id != &claims.run_id {
            return Err(ApiError::unauthorized("Invalid token"));
        }
    }

    let runner = RunnerInfo {
        run_id: Some(claims.run_id.clone()),
        run_number: claims.run_number.clone(),
        run_attempt: claims.run_attempt.clone(),
        workflow: claims.workflow.clone(),
        repository: Some(claims.repository.clone()),
        sha: claims.sha.clone(),
        url: None,
        steps: Vec::new(),
    };
    let session = state
        .sessions
        .attach_runner(&payload.session_id, runner)
        .await?;
    Ok(Json(session.into()))
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateKind {
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateRequest {
    pub status: UpdateKind,
    #[serde(default)]
    pub progress: Option<u8>,
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub result: Option<PublishResult>,
    #[serde(default)]
    pub error: Option<PublishErrorInfo>,
}

#[tracing::instrument(name = "POST /publish/sessions/update", skip(state, headers, payload))]
pub async fn update_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<UpdateRequest>,
) -> Result<Json<SessionView>, ApiError> {
    let context = authenticate_runner(&state, &headers).await?;
    let session_id = session_for_runner(&state, &context).await?;

    let session = match payload.status {
        UpdateKind::InProgress => {
            state
                .sessions
                .update_progress(&session_id, payload.progress, payload.phase, payload.message)
                .await?
        }
        UpdateKind::Completed => {
            let result = payload
                .result
                .ok_or_else(|| ApiError::bad_request("'completed' requires a result"))?;
            state.sessions.complete(&session_id, result).await?
        }
        UpdateKind::Failed => {
            let error = payload
                .error
                .ok_or_else(|| ApiError::bad_request("'failed' requires an error"))?;
            state.sessions.fail(&session_id, error).await?
        }
    };
    Ok(Json(session.into()))
}
