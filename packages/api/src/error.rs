use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

use axum::{Json, http::HeaderValue};

use serde::Serialize;

use crate::publish::{DispatchError, PublishError, SessionStoreError};
use crate::token::TokenError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReportPolicy {
    Ignore,
    Report,
}

#[derive(Debug, Clone)]
pub struct ApiError {
    status: StatusCode,
    public_code: String,
    public_message: Option<String>,
    report_policy: ReportPolicy,
}

// Associated constant for enum-like usage without parentheses
impl ApiError {
    pub const UNAUTHORIZED: ApiError = ApiError {
        status: StatusCode::UNAUTHORIZED,
        public_code: String::new(),
        public_message: None,
        report_policy: ReportPolicy::Ignore,
    };
}

impl ApiError {
    fn new(
        status: StatusCode,
        public_code: impl Into<String>,
        public_message: Option<String>,
        report_policy: ReportPolicy,
    ) -> Self {
        Self {
            status,
            public_code: public_code.into(),
            public_message,
            report_policy,
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::warn!("Not found: {}", msg);
        Self::new(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            Some(msg),
            ReportPolicy::Ignore,
        )
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::warn!("Bad request: {}", msg);
        Self::new(
            StatusCode::BAD_REQUEST,
            "BAD_REQUEST",
            Some(msg),
            ReportPolicy::Ignore,
        )
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::warn!("Unauthorized: {}", msg);
        Self::new(
            StatusCode::UNAUTHORIZED,
            "UNAUTHORIZED",
            Some(msg),
            ReportPolicy::Ignore,
        )
    }

    /// 425 Too Early. Used for combined-token retrieval before runner
    /// attestation and after the one-time token was consumed.
    pub fn too_early(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::warn!("Too early: {}", msg);
        Self::new(
            StatusCode::from_u16(425).unwrap_or(StatusCode::CONFLICT),
            "TOO_EARLY",
            Some(msg),
            ReportPolicy::Ignore,
        )
    }

    pub fn bad_gateway(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::error!("Bad gateway: {}", msg);
        Self::new(
            StatusCode::BAD_GATEWAY,
            "UPSTREAM_ERROR",
            Some("Upstream dispatch failed".to_string()),
            ReportPolicy::Report,
        )
    }

    pub fn service_unavailable(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::error!("Service unavailable: {}", msg);
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "STORE_UNAVAILABLE",
            Some("Service temporarily unavailable".to_string()),
            ReportPolicy::Report,
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorEnvelope<'a> {
            error: ErrorBody<'a>,
        }

        #[derive(Serialize)]
        struct ErrorBody<'a> {
            code: &'a str,
            #[serde(skip_serializing_if = "Option::is_none")]
            id: Option<&'a str>,
            message: &'a str,
        }

        let code = if self.public_code.is_empty() {
            match self.status {
                StatusCode::NOT_FOUND => "NOT_FOUND",
                StatusCode::UNAUTHORIZED => "UNAUTHORIZED",
                StatusCode::BAD_REQUEST => "BAD_REQUEST",
                _ => "ERROR",
            }
        } else {
            self.public_code.as_str()
        };

        let public_message = self
            .public_message
            .as_deref()
            .unwrap_or_else(|| self.status.canonical_reason().unwrap_or("Error"));

        // Correlates a server-side failure with its log lines.
        let mut error_id: Option<String> = None;
        if self.report_policy == ReportPolicy::Report {
            let id = uuid::Uuid::new_v4().to_string();
            tracing::error!(error_id = %id, code, "Request failed");
            error_id = Some(id);
        }

        let mut response = (
            self.status,
            Json(ErrorEnvelope {
                error: ErrorBody {
                    code,
                    id: error_id.as_deref(),
                    message: public_message,
                },
            }),
        )
            .into_response();

        if let Some(id) = error_id.as_deref() {
            if let Ok(v) = HeaderValue::from_str(id) {
                response.headers_mut().insert("x-error-id", v);
            }
        }

        response
    }
}

impl From<PublishError> for ApiError {
    fn from(err: PublishError) -> Self {
        match err {
            PublishError::SessionNotFound => Self::not_found("Session not found"),
            PublishError::InvalidTransition { from, operation } => Self::bad_request(format!(
                "Operation '{}' is not valid from state '{}'",
                operation, from
            )),
            PublishError::Store(err) => err.into(),
        }
    }
}

impl From<SessionStoreError> for ApiError {
    fn from(err: SessionStoreError) -> Self {
        tracing::error!("Session store error: {:?}", err);
        Self::service_unavailable(err.to_string())
    }
}

impl From<TokenError> for ApiError {
    fn from(err: TokenError) -> Self {
        // Intentionally generic outward message; the detail stays in the logs.
        tracing::warn!("Token error: {:?}", err);
        Self::unauthorized("Invalid token")
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        tracing::error!("Dispatch error: {:?}", err);
        Self::bad_gateway(err.to_string())
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        tracing::warn!("JSON error: {:?}", err);
        // Parsing errors are typically caller-caused.
        Self::bad_request(format!("JSON error: {}", err))
    }
}

impl std::error::Error for ApiError {}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.status, self.public_code.as_str())
    }
}
