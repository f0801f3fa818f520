use axum::{Json, body::Bytes, extract::State, http::HeaderMap};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{Value, json};
use sha2::Sha256;

use crate::error::ApiError;
use crate::publish::PublishErrorInfo;
use crate::state::AppState;

type HmacSha256 = Hmac<Sha256>;

/// Verifies `x-hub-signature-256` over the raw payload. `verify_slice` does
/// the constant-time compare.
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> Result<(), ApiError> {
    let hex_digest = signature
        .strip_prefix("sha256=")
        .ok_or_else(|| ApiError::unauthorized("Invalid signature"))?;
    let expected =
        hex::decode(hex_digest).map_err(|_| ApiError::unauthorized("Invalid signature"))?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| ApiError::unauthorized("Invalid signature"))?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| ApiError::unauthorized("Invalid signature"))
}

#[derive(Debug, Deserialize)]
struct WorkflowRunEvent {
    action: String,
    workflow_run: WorkflowRun,
}

#[derive(Debug, Deserialize)]
struct WorkflowRun {
    id: u64,
    #[serde(default)]
    conclusion: Option<String>,
    #[serde(default)]
    html_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WorkflowJobEvent {
    workflow_job: WorkflowJob,
}

#[derive(Debug, Deserialize)]
struct WorkflowJob {
    run_id: u64,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    steps: Vec<JobStep>,
}

#[derive(Debug, Deserialize)]
struct JobStep {
    name: String,
}

#[tracing::instrument(name = "POST /webhook/ci", skip(state, headers, body))]
pub async fn ci_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    // Authentication comes first: nothing is parsed and no store access
    // happens until the signature checks out.
    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("Missing signature"))?;
    verify_signature(&state.config.webhook_secret, &body, signature)?;

    let event = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    match event {
        "workflow_run" => {
            let payload: WorkflowRunEvent = serde_json::from_slice(&body)?;
            handle_workflow_run(&state, payload).await?;
        }
        "workflow_job" => {
            let payload: WorkflowJobEvent = serde_json::from_slice(&body)?;
            handle_workflow_job(&state, payload).await?;
        }
        other => {
            tracing::debug!(event = other, "Ignoring webhook event");
        }
    }

    Ok(Json(json!({ "received": true })))
}

/// Terminal-failure safety net: if the run dies without a completion
/// callback, the webhook moves the session to `failed`.
async fn handle_workflow_run(state: &AppState, event: WorkflowRunEvent) -> Result<(), ApiError> {
    let run_id = event.workflow_run.id.to_string();
    let Some(session_id) = state.sessions.session_for_run(&run_id).await? else {
        tracing::debug!(%run_id, "Webhook run has no bound session");
        return Ok(());
    };

    if let Some(url) = event.workflow_run.html_url.clone() {
        // Enrichment only; a terminal session rejects this and that is fine.
        let _ = state
            .sessions
            .record_dispatch(&session_id, Some(run_id.clone()), Some(url))
            .await;
    }

    if event.action != "completed" {
        return Ok(());
    }
    let conclusion = event.workflow_run.conclusion.as_deref().unwrap_or("unknown");
    if conclusion == "success" {
        // The runner's own completion callback is authoritative.
        return Ok(());
    }

    let outcome = state
        .sessions
        .fail(
            &session_id,
            PublishErrorInfo {
                code: "ci_failure".to_string(),
                message: format!("CI run finished with conclusion '{}'", conclusion),
                details: None,
            },
        )
        .await;
    match outcome {
        Ok(_) => {
            tracing::info!(%session_id, %run_id, conclusion, "Failed session from webhook");
            Ok(())
        }
        // Already terminal or expired; webhooks are redelivered and unordered.
        Err(crate::publish::PublishError::InvalidTransition { .. })
        | Err(crate::publish::PublishError::SessionNotFound) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

async fn handle_workflow_job(state: &AppState, event: WorkflowJobEvent) -> Result<(), ApiError> {
    let run_id = event.workflow_job.run_id.to_string();
    let Some(session_id) = state.sessions.session_for_run(&run_id).await? else {
        return Ok(());
    };

    let steps = event
        .workflow_job
        .steps
        .into_iter()
        .map(|step| step.name)
        .collect();
    match state
        .sessions
        .record_job(&session_id, event.workflow_job.name, steps)
        .await
    {
        Ok(_) => Ok(()),
        Err(crate::publish::PublishError::InvalidTransition { .. })
        | Err(crate::publish::PublishError::SessionNotFound) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_a_valid_signature() {
        let body = br#"{"action":"completed"}"#;
        let mut mac = HmacSha256::new_from_slice(b"secret").unwrap();
        mac.update(body);
        let sig = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));
        assert!(verify_signature("secret", body, &sig).is_ok());
    }

    #[test]
    fn rejects_a_tampered_body() {
        let body = br#"{"action":"completed"}"#;
        let mut mac = HmacSha256::new_from_slice(b"secret").unwrap();
        mac.update(body);
        let sig = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));
        assert!(verify_signature("secret", br#"{"action":"requested"}"#, &sig).is_err());
    }

    #[test]
    fn rejects_malformed_signature_headers() {
        assert!(verify_signature("secret", b"x", "sha256=zzzz").is_err());
        assert!(verify_signature("secret", b"x", "md5=abcd").is_err());
        assert!(verify_signature("secret", b"x", "").is_err());
    }
}
