use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Failures of an explicitly requested actuator dispatch.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("device {0} not found")]
    DeviceNotFound(i64),

    #[error("actuator {0} not found")]
    ActuatorNotFound(i64),

    #[error("actuator {actuator_id} does not belong to device {device_id}")]
    ActuatorNotOnDevice { device_id: i64, actuator_id: i64 },

    #[error("store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl DispatchError {
    pub fn is_not_found(&self) -> bool {
        !matches!(self, Self::Store(_))
    }
}

/// Errors surfaced by the HTTP boundary.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            Self::Dispatch(e) if e.is_not_found() => (StatusCode::NOT_FOUND, e.to_string()),
            Self::Dispatch(e) => {
                tracing::error!("dispatch failed: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            Self::Internal(e) => {
                tracing::error!("request failed: {e:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
