use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::middleware::auth::AuthPrincipal;
use crate::publish::{
    PublishErrorInfo, PublishResult, PublishSession, PublishStatus, RunnerInfo,
};
use crate::state::AppState;
use crate::token::combined::SCOPE_PUBLISH_UPDATE;

/// Session as presented over HTTP. The store-internal revision counter is
/// deliberately absent.
#[derive(Debug, Serialize, ToSchema)]
pub struct SessionView {
    pub id: String,
    pub status: PublishStatus,
    pub content_id: String,
    pub format: String,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gh: Option<RunnerInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<PublishResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<PublishErrorInfo>,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
}

impl From<PublishSession> for SessionView {
    fn from(session: PublishSession) -> Self {
        Self {
            id: session.id,
            status: session.status,
            content_id: session.content_id,
            format: session.format,
            progress: session.progress,
            phase: session.phase,
            message: session.message,
            gh: session.gh,
            result: session.result,
            error: session.error,
            created_at: session.created_at,
            updated_at: session.updated_at,
            completed_at: session.completed_at,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateSessionRequest {
    pub content_id: String,
    #[serde(default = "default_format")]
    pub format: String,
}

fn default_format() -> String {
    "epub".to_string()
}

#[utoipa::path(
    post,
    path = "/publish/sessions",
    request_body = CreateSessionRequest,
    responses(
        (status = 201, description = "Session created and workflow dispatched", body = SessionView),
        (status = 502, description = "Workflow dispatch failed; session is terminal")
    ),
    security(("bearer" = []))
)]
#[tracing::instrument(name = "POST /publish/sessions", skip(state, principal, payload))]
pub async fn create_session(
    State(state): State<AppState>,
    Extension(principal): Extension<AuthPrincipal>,
    Json(payload): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionView>), ApiError> {
    let user_id = principal.sub()?;
    if payload.content_id.trim().is_empty() {
        return Err(ApiError::bad_request("content_id must not be empty"));
    }

    let session = state
        .sessions
        .create(user_id, &payload.content_id, &payload.format)
        .await?;

    match state
        .dispatcher
        .trigger(&payload.content_id, &payload.format, &session.id)
        .await
    {
        Ok(receipt) => {
            // Stash the handoff token only for a session whose workflow
            // actually started; a failed dispatch leaves nothing to hand out.
            let token = state
                .combined_tokens
                .issue(&session.id, SCOPE_PUBLISH_UPDATE)?;
            state
                .sessions
                .stash_combined_token(&session.id, &token)
                .await?;

            let session = if receipt.run_id.is_some() || receipt.url.is_some() {
                let id = session.id.clone();
                state
                    .sessions
                    .record_dispatch(&id, receipt.run_id, receipt.url)
                    .await
                    .unwrap_or(session)
            } else {
                session
            };
            Ok((StatusCode::CREATED, Json(session.into())))
        }
        Err(err) => {
            // The client sees a terminal record; a retry is a new session.
            let _ = state
                .sessions
                .fail(
                    &session.id,
                    PublishErrorInfo {
                        code: "dispatch_failure".to_string(),
                        message: "The publish workflow could not be started".to_string(),
                        details: None,
                    },
                )
                .await;
            Err(err.into())
        }
    }
}

#[utoipa::path(
    get,
    path = "/publish/sessions/{id}/status",
    params(("id" = String, Path, description = "Session id")),
    responses(
        (status = 200, body = SessionView),
        (status = 404, description = "Unknown session or not the owner")
    ),
    security(("bearer" = []))
)]
#[tracing::instrument(name = "GET /publish/sessions/{id}/status", skip(state, principal))]
pub async fn get_status(
    State(state): State<AppState>,
    Extension(principal): Extension<AuthPrincipal>,
    Path(id): Path<String>,
) -> Result<Json<SessionView>, ApiError> {
    let user_id = principal.sub()?;
    let session = state.sessions.get_owned(&id, user_id).await?;
    Ok(Json(session.into()))
}

#[derive(Debug, Deserialize)]
pub struct CombinedTokenQuery {
    pub session_id: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CombinedTokenResponse {
    pub combined_token: String,
}

#[utoipa::path(
    get,
    path = "/publish/sessions/combined-token",
    params(("session_id" = String, Query, description = "Session id")),
    responses(
        (status = 200, body = CombinedTokenResponse),
        (status = 404, description = "Unknown session or not the owner"),
        (status = 425, description = "Runner not attested yet, or token already consumed")
    ),
    security(("bearer" = []))
)]
#[tracing::instrument(name = "GET /publish/sessions/combined-token", skip(state, principal, query))]
pub async fn combined_token(
    State(state): State<AppState>,
    Extension(principal): Extension<AuthPrincipal>,
    Query(query): Query<CombinedTokenQuery>,
) -> Result<Json<CombinedTokenResponse>, ApiError> {
    let user_id = principal.sub()?;
    let session = state.sessions.get_owned(&query.session_id, user_id).await?;

    if session.status == PublishStatus::Pending {
        return Err(ApiError::too_early("Runner has not attested yet"));
    }

    match state.sessions.consume_combined_token(&session.id).await? {
        Some(combined_token) => Ok(Json(CombinedTokenResponse { combined_token })),
        None => Err(ApiError::too_early("Combined token was already consumed")),
    }
}

#[tracing::instrument(name = "GET /publish/.well-known/jwks.json", skip(state))]
pub async fn publish_jwks(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    Ok(Json(state.combined_tokens.jwks()?))
}
