use crate::oidc::AuthError;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use pages::{ConfigError, StorageError};
use serde_json::json;
use thiserror::Error;

/// Non-standard status for a client that went away mid-request.
const STATUS_CLIENT_CLOSED_REQUEST: u16 = 499;

/// Failures of the ingest pipeline. Clients get a short JSON diagnostic;
/// the full cause chain stays in the logs.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("invalid authorization header")]
    Auth(#[source] AuthError),

    #[error("repository not authorized")]
    RepositoryNotAuthorized,

    #[error("invalid multipart form")]
    InvalidForm(#[source] axum::extract::multipart::MultipartError),

    #[error("invalid file path {0:?} in upload")]
    InvalidFilePath(String),

    #[error("failed to save artifacts")]
    Spool(#[source] std::io::Error),

    #[error("failed to save artifacts")]
    Publish(#[source] StorageError),

    #[error("failed to update page metadata")]
    Index(#[source] StorageError),

    #[error("invalid page configuration")]
    Config(#[from] ConfigError),

    #[error("request canceled")]
    Canceled,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Auth(_) | ApiError::RepositoryNotAuthorized => StatusCode::FORBIDDEN,
            ApiError::InvalidForm(_) | ApiError::InvalidFilePath(_) => StatusCode::BAD_REQUEST,
            ApiError::Spool(_) | ApiError::Publish(_) | ApiError::Index(_) | ApiError::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::Canceled => StatusCode::from_u16(STATUS_CLIENT_CLOSED_REQUEST)
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        // The response carries the short form only; log the cause chain here
        let mut chain = self.to_string();
        let mut source = std::error::Error::source(&self);
        while let Some(cause) = source {
            chain.push_str(": ");
            chain.push_str(&cause.to_string());
            source = cause.source();
        }
        tracing::error!(http.code = status.as_u16(), error = chain, "upload request failed");

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
