use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use sqlx::migrate::MigrateError;
use thiserror::Error;

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Push delivery error: {0}")]
    Push(#[from] PushError),

    #[error("Locale error: {0}")]
    Locale(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Service at capacity: {0}")]
    Capacity(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Push-delivery errors
#[derive(Error, Debug)]
pub enum PushError {
    #[error("Push endpoint not configured")]
    EndpointMissing,

    #[error("Push endpoint rejected delivery with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Push request failed: {0}")]
    Transport(String),
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = match self {
            AppError::Push(PushError::Rejected { status, .. }) => (
                StatusCode::BAD_GATEWAY,
                "PUSH_REJECTED",
                "Push endpoint rejected delivery".to_string(),
                Some(serde_json::json!({ "upstream_status": status })),
            ),
            AppError::Push(_) => (
                StatusCode::BAD_GATEWAY,
                "EXTERNAL_ERROR",
                "An upstream service failed".to_string(),
                None,
            ),
            AppError::Capacity(reason) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "AT_CAPACITY",
                reason,
                None,
            ),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "A database error occurred".to_string(),
                None,
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
                None,
            ),
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
            details,
        });

        (status, body).into_response()
    }
}

impl From<reqwest::Error> for AppError {
    fn from(error: reqwest::Error) -> Self {
        AppError::Push(PushError::Transport(error.to_string()))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(error: serde_json::Error) -> Self {
        AppError::Internal(format!("JSON error: {}", error))
    }
}

impl From<MigrateError> for AppError {
    fn from(error: MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
