use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Failure modes that callers branch on. Everything that only needs to be
/// reported, not handled, flows through `Storage` as anyhow context.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no active transport session for tenant {0}")]
    SessionUnavailable(String),

    #[error("a dispatch is already running for tenant {0}")]
    DispatchInProgress(String),

    #[error("daily quota reached: {sent_today} of {limit}")]
    QuotaExceeded { sent_today: i64, limit: i64 },

    #[error("pairing code not issued yet")]
    CodeNotReady,

    #[error("transport already connected for tenant {0}")]
    AlreadyConnected(String),

    #[error("tenant not found: {0}")]
    TenantNotFound(String),

    #[error("campaign not found: {0}")]
    CampaignNotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("media read failed: {0}")]
    MediaRead(#[from] std::io::Error),

    #[error("sidecar request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl EngineError {
    pub fn status(&self) -> StatusCode {
        match self {
            EngineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            EngineError::TenantNotFound(_)
            | EngineError::CampaignNotFound(_)
            | EngineError::SessionUnavailable(_)
            | EngineError::CodeNotReady => StatusCode::NOT_FOUND,
            EngineError::DispatchInProgress(_) | EngineError::AlreadyConnected(_) => {
                StatusCode::CONFLICT
            }
            EngineError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            EngineError::MediaRead(_)
            | EngineError::Http(_)
            | EngineError::Transport(_)
            | EngineError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            EngineError::QuotaExceeded { sent_today, limit } => json!({
                "error": self.to_string(),
                "sent_today": sent_today,
                "limit": limit,
                "remaining": (limit - sent_today).max(0),
            }),
            EngineError::CodeNotReady => json!({
                "error": self.to_string(),
                "code_pending": true,
            }),
            _ => json!({"error": self.to_string()}),
        };
        (status, Json(body)).into_response()
    }
}
