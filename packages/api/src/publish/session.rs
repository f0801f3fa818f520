use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum PublishStatus {
    Pending,
    RunnerAttested,
    InProgress,
    Completed,
    Failed,
}

impl PublishStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PublishStatus::Completed | PublishStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PublishStatus::Pending => "pending",
            PublishStatus::RunnerAttested => "runner-attested",
            PublishStatus::InProgress => "in-progress",
            PublishStatus::Completed => "completed",
            PublishStatus::Failed => "failed",
        }
    }
}

/// CI runner identity recorded at attestation and enriched by webhooks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RunnerInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_attempt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Job step names reported by `workflow_job` webhook events.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PublishResult {
    pub artifact_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PublishErrorInfo {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// One publish attempt. Stored as JSON with a TTL; `revision` guards
/// concurrent writers and never leaves the store layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishSession {
    pub id: String,
    pub user_id: String,
    pub status: PublishStatus,
    pub content_id: String,
    pub format: String,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
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
    #[serde(default)]
    pub revision: u64,
}

impl PublishSession {
    pub fn new(id: String, user_id: String, content_id: String, format: String) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id,
            user_id,
            status: PublishStatus::Pending,
            content_id,
            format,
            progress: 0,
            phase: None,
            message: None,
            metadata: BTreeMap::new(),
            gh: None,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            revision: 0,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = chrono::Utc::now().timestamp_millis();
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionStoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("stored record is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("session not found")]
    SessionNotFound,
    #[error("operation '{operation}' is invalid from state '{from}'")]
    InvalidTransition {
        from: &'static str,
        operation: &'static str,
    },
    #[error(transparent)]
    Store(#[from] SessionStoreError),
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("workflow dispatch request failed: {0}")]
    Request(String),
    #[error("workflow dispatch rejected: status {status}")]
    Rejected { status: u16 },
    #[error("workflow dispatch timed out")]
    Timeout,
}

/// Outcome of `SessionStore::compare_and_swap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Written,
    /// The stored revision no longer matches; re-read and retry.
    Conflict,
    Missing,
}

/// TTL'd session persistence. One record per session id; a dedicated slot
/// holds the one-time combined token, and a secondary index maps CI run ids
/// back to sessions.
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert(&self, session: &PublishSession) -> Result<(), SessionStoreError>;

    async fn get(&self, id: &str) -> Result<Option<PublishSession>, SessionStoreError>;

    /// Replaces the record only if the stored `revision` equals
    /// `session.revision - 1` (the revision the writer read).
    async fn compare_and_swap(
        &self,
        session: &PublishSession,
    ) -> Result<CasOutcome, SessionStoreError>;

    async fn put_token(&self, session_id: &str, token: &str) -> Result<(), SessionStoreError>;

    /// Atomic get-and-delete; at most one caller ever receives the token.
    async fn take_token(&self, session_id: &str) -> Result<Option<String>, SessionStoreError>;

    async fn index_run(&self, run_id: &str, session_id: &str) -> Result<(), SessionStoreError>;

    async fn session_for_run(&self, run_id: &str) -> Result<Option<String>, SessionStoreError>;

    async fn ping(&self) -> Result<(), SessionStoreError>;
}
