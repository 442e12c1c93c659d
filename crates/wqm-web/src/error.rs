use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use wqm_core::ScheduleError;
use wqm_storage::StorageError;
use wqm_sync::RegistrationError;

/// Handler error rendered as `{"error": "..."}`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Upstream(String),

    #[error("{0:#}")]
    Internal(#[from] anyhow::Error),
}

pub type AppResult<T> = Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Upstream(msg) => {
                tracing::warn!("provider failure: {msg}");
                StatusCode::BAD_GATEWAY
            }
            AppError::Internal(err) => {
                tracing::error!("internal error: {err:#}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<ScheduleError> for AppError {
    fn from(err: ScheduleError) -> Self {
        match err {
            ScheduleError::CapExceeded { .. } => AppError::Conflict(err.to_string()),
            ScheduleError::InvalidTime(_) | ScheduleError::InvalidOffset(_) => {
                AppError::Validation(err.to_string())
            }
        }
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { .. } => AppError::NotFound(err.to_string()),
            StorageError::Schedule(inner) => inner.into(),
            other => AppError::Internal(other.into()),
        }
    }
}

impl From<RegistrationError> for AppError {
    fn from(err: RegistrationError) -> Self {
        match err {
            RegistrationError::BlankPhoneNumberId | RegistrationError::MissingCredential => {
                AppError::Validation(err.to_string())
            }
            RegistrationError::Provider(_) | RegistrationError::Mapping(_) => {
                AppError::Upstream(err.to_string())
            }
            RegistrationError::Storage(inner) => inner.into(),
        }
    }
}
