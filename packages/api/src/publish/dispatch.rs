use serde::Deserialize;
use serde_json::json;

use crate::config::DispatchSettings;

use super::session::DispatchError;

/// What the CI provider told us about the dispatched run. `workflow_dispatch`
/// itself returns nothing, so both fields are best-effort; the authoritative
/// run identity arrives later with the runner's attestation.
#[derive(Debug, Clone, Default)]
pub struct DispatchReceipt {
    pub run_id: Option<String>,
    pub url: Option<String>,
}

/// Triggers the publish workflow on the CI provider. Failures never advance
/// session state and are never retried here; the caller decides.
pub struct WorkflowDispatcher {
    client: reqwest::Client,
    settings: DispatchSettings,
}

impl WorkflowDispatcher {
    pub fn new(settings: DispatchSettings) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| DispatchError::Request(e.to_string()))?;
        Ok(Self { client, settings })
    }

    #[tracing::instrument(name = "dispatch_workflow", skip(self))]
    pub async fn trigger(
        &self,
        content_id: &str,
        format: &str,
        session_id: &str,
    ) -> Result<DispatchReceipt, DispatchError> {
        let url = format!(
            "{}/repos/{}/actions/workflows/{}/dispatches",
            self.settings.api_base, self.settings.repository, self.settings.workflow_file
        );
        let body = json!({
            "ref": self.settings.git_ref,
            "inputs": {
                "session_id": session_id,
                "content_id": content_id,
                "format": format,
            }
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.settings.token)
            .header("accept", "application/vnd.github+json")
            .header("user-agent", "bindery")
            .json(&body)
            .send()
            .await
            .map_err(map_request_error)?;

        if !response.status().is_success() {
            return Err(DispatchError::Rejected {
                status: response.status().as_u16(),
            });
        }

        tracing::info!(session_id, "Dispatched publish workflow");
        Ok(self.lookup_latest_run().await.unwrap_or_default())
    }

    /// One best-effort poll for the run we just triggered. The provider
    /// offers no correlation on dispatch, so a miss here is fine.
    async fn lookup_latest_run(&self) -> Option<DispatchReceipt> {
        #[derive(Deserialize)]
        struct RunList {
            workflow_runs: Vec<Run>,
        }
        #[derive(Deserialize)]
        struct Run {
            id: u64,
            html_url: Option<String>,
        }

        let url = format!(
            "{}/repos/{}/actions/workflows/{}/runs?event=workflow_dispatch&per_page=1",
            self.settings.api_base, self.settings.repository, self.settings.workflow_file
        );
        let list: RunList = self
            .client
            .get(&url)
            .bearer_auth(&self.settings.token)
            .header("accept", "application/vnd.github+json")
            .header("user-agent", "bindery")
            .send()
            .await
            .ok()?
            .error_for_status()
            .ok()?
            .json()
            .await
            .ok()?;

        let run = list.workflow_runs.into_iter().next()?;
        Some(DispatchReceipt {
            run_id: Some(run.id.to_string()),
            url: run.html_url,
        })
    }
}

fn map_request_error(err: reqwest::Error) -> DispatchError {
    if err.is_timeout() {
        DispatchError::Timeout
    } else {
        DispatchError::Request(err.to_string())
    }
}
