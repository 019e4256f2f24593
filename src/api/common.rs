//! Common types for status API responses and errors

use crate::hub::NodeCommand;
use crate::registry::NodeStatus;
use crate::Error;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

/// API error response
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub message: String,
}

impl ApiError {
    pub fn new(message: impl Into<String>) -> Self {
        ApiError {
            message: message.into(),
        }
    }

    pub fn not_found(resource: &str) -> (StatusCode, Json<ApiError>) {
        (
            StatusCode::NOT_FOUND,
            Json(ApiError::new(format!("{} not found", resource))),
        )
    }

    pub fn bad_request(message: impl Into<String>) -> (StatusCode, Json<ApiError>) {
        (StatusCode::BAD_REQUEST, Json(ApiError::new(message)))
    }

    pub fn service_unavailable(message: impl Into<String>) -> (StatusCode, Json<ApiError>) {
        (StatusCode::SERVICE_UNAVAILABLE, Json(ApiError::new(message)))
    }

    /// Map a crate error onto a status code
    pub fn from_error(err: &Error) -> (StatusCode, Json<ApiError>) {
        let status = match err {
            Error::NodeUnreachable(_) => StatusCode::CONFLICT,
            Error::Protocol(_) | Error::Parse(_) => StatusCode::BAD_REQUEST,
            Error::NoAvailableNode(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ApiError::new(err.to_string())))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, Json(self)).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

/// GET /nodes filters
#[derive(Debug, Default, Deserialize)]
pub struct NodesParams {
    pub country: Option<String>,
    pub status: Option<NodeStatus>,
}

/// POST /nodes/:id/command body
#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub command: NodeCommand,
}
