use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::error::AppError;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Outermost, user-meaningful error for the RPC surface. Internal detail
/// stays in the logs, keyed by the correlation id echoed to the caller.
#[derive(Error, Debug, Clone)]
pub enum RpcError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Capability unavailable: {0}")]
    CapabilityUnavailable(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal server error")]
    Internal(String),
}

impl From<AppError> for RpcError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::Validation(msg) => Self::Validation(msg),
            AppError::NotFound(msg) => Self::NotFound(msg),
            AppError::CapabilityUnavailable(capability) => {
                Self::CapabilityUnavailable(capability)
            }
            AppError::Cancelled => Self::Cancelled,
            other => {
                tracing::error!(error = %other, "internal error crossing the RPC boundary");
                Self::Internal(other.to_string())
            }
        }
    }
}

#[derive(Serialize, Debug)]
struct ErrorResponse {
    error: String,
    status: String,
    correlation_id: String,
}

impl IntoResponse for RpcError {
    fn into_response(self) -> Response {
        let correlation_id = Uuid::new_v4().to_string();
        let (status, message) = match &self {
            Self::Validation(message) => (StatusCode::BAD_REQUEST, message.clone()),
            Self::NotFound(message) => (StatusCode::NOT_FOUND, message.clone()),
            Self::CapabilityUnavailable(capability) => (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("no backend available for '{capability}'"),
            ),
            Self::Cancelled => (StatusCode::CONFLICT, "operation cancelled".to_string()),
            Self::Internal(detail) => {
                tracing::error!(%correlation_id, detail, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        (
            status,
            Json(ErrorResponse {
                error: message,
                status: "error".to_string(),
                correlation_id,
            }),
        )
            .into_response()
    }
}
