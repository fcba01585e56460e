use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::fmt::Display;
use thiserror::Error;

/// Failures of the synchronization pipeline.
///
/// Only [`SyncError::BackupWrite`] reaches the submitter; every other variant
/// is recorded on the submission record and logged.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no usable credential: {0}")]
    Auth(String),
    #[error("remote document is locked: {0}")]
    RemoteLocked(String),
    #[error("remote write failed: {0}")]
    RemoteWrite(String),
    #[error("attachment transfer failed for {filename}: {reason}")]
    Transfer { filename: String, reason: String },
    #[error("backup write failed: {0}")]
    BackupWrite(String),
}

impl SyncError {
    pub fn is_locked(&self) -> bool {
        matches!(self, SyncError::RemoteLocked(_))
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized")
    }

    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "resource not found")
    }

    pub fn internal<E: Display>(error: E) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status;
        let body = Json(ErrorResponse {
            error: self.message,
        });
        (status, body).into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl From<SyncError> for AppError {
    fn from(value: SyncError) -> Self {
        match value {
            SyncError::Auth(_) => AppError::new(StatusCode::BAD_GATEWAY, value.to_string()),
            SyncError::RemoteLocked(_) => AppError::new(StatusCode::CONFLICT, value.to_string()),
            _ => AppError::internal(value),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        AppError::internal(value)
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        AppError::internal(value)
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        AppError::internal(value)
    }
}
