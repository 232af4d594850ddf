use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("empty input")]
    EmptyInput,

    #[error("empty corpus")]
    EmptyCorpus,

    #[error("collection not found: {0}")]
    CollectionGone(String),

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("upstream request timed out")]
    Timeout,

    #[error("transient upstream failure: {0}")]
    Transient(String),

    #[error("index error: {0}")]
    IndexError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,
}

impl AppError {
    /// Network/5xx/timeout failures are the only ones worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Transient(_) | AppError::Timeout)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::InvalidArgument(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            AppError::EmptyInput => (StatusCode::BAD_REQUEST, self.to_string()),
            AppError::EmptyCorpus => (StatusCode::BAD_REQUEST, self.to_string()),
            AppError::CollectionGone(_) => (StatusCode::NOT_FOUND, self.to_string()),
            AppError::DimensionMismatch { .. } => (StatusCode::BAD_REQUEST, self.to_string()),
            AppError::Timeout => (StatusCode::GATEWAY_TIMEOUT, self.to_string()),
            AppError::Transient(_) => (StatusCode::BAD_GATEWAY, self.to_string()),
            AppError::IndexError(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            AppError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            AppError::Serde(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal server error".to_string(),
            ),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
        };

        let body = json!({
            "error": message,
            "status": status.as_u16(),
        });

        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
