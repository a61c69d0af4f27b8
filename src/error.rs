use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Invalid line id: {0}")]
    InvalidId(u32),
    #[error("Line already claimed: {0}")]
    AlreadyClaimed(u32),
    #[error("Failed to bind interrupt for line {line}: {reason}")]
    BindFailure { line: u32, reason: String },
    #[error("Edge handled partially: {0}")]
    PartialHandling(String),
    #[error("Failed to launch {path}: {reason}")]
    SpawnFailure { path: String, reason: String },
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Invalid value: {0}")]
    InvalidValue(String),
    #[error("Line not found: {0}")]
    NotFoundLine(u32),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("GPIO error: {0}")]
    Gpio(String),
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFoundLine(_) => StatusCode::NOT_FOUND,
            AppError::InvalidId(_) | AppError::InvalidValue(_) => StatusCode::BAD_REQUEST,
            AppError::InvalidState(_) | AppError::AlreadyClaimed(_) => StatusCode::CONFLICT,
            AppError::BindFailure { .. }
            | AppError::PartialHandling(_)
            | AppError::SpawnFailure { .. }
            | AppError::Config(_)
            | AppError::Gpio(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "error": self.to_string() }))
    }
}
