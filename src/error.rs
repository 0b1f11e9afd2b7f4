use crate::auth::AuthError;
use crate::ingest::IngestError;
use crate::pipeline::UploadError;
use crate::state::StoreError;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Errors as seen by HTTP clients. Internal details are logged, not returned.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(&'static str),
    #[error("{0}")]
    Forbidden(&'static str),
    #[error("{0}")]
    NotFound(&'static str),
    #[error("{0}")]
    PayloadTooLarge(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg.to_string()),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg.to_string()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.to_string()),
            ApiError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, msg),
            ApiError::Internal(e) => {
                tracing::error!("Internal error: {:#}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Server error".to_string())
            }
        };
        (status, Json(json!({ "success": false, "message": message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateEmail => ApiError::BadRequest(err.to_string()),
            StoreError::AgentNotFound => ApiError::NotFound("Agent not found"),
            StoreError::LeadNotFound => ApiError::NotFound("Lead not found"),
            StoreError::Journal(_) | StoreError::Encode(_) => ApiError::Internal(err.into()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::WeakPassword => ApiError::BadRequest(err.to_string()),
            _ => ApiError::Internal(err.into()),
        }
    }
}

impl From<UploadError> for ApiError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::NoFile
            | UploadError::InvalidType
            | UploadError::NoValidLeads
            | UploadError::NoActiveAgents => ApiError::BadRequest(err.to_string()),
            UploadError::Multipart(msg) => ApiError::BadRequest(msg),
            UploadError::TooLarge { .. } => ApiError::PayloadTooLarge(err.to_string()),
            UploadError::Ingest(IngestError::UnsupportedFormat)
            | UploadError::Ingest(IngestError::ContentMismatch) => {
                ApiError::BadRequest(err.to_string())
            }
            UploadError::Store(e) => e.into(),
            UploadError::Ingest(_) | UploadError::Io(_) | UploadError::Task(_) => {
                ApiError::Internal(err.into())
            }
        }
    }
}
