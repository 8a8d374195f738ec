//! API error types

use agentfield_core::ControlPlaneError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// API error type
#[derive(Debug)]
pub struct ApiError(pub ControlPlaneError);

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for ApiError {}

/// Error response JSON structure
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match &self.0 {
            ControlPlaneError::Validation(_) => StatusCode::BAD_REQUEST,
            ControlPlaneError::NotFound { .. } => StatusCode::NOT_FOUND,
            ControlPlaneError::Conflict(_) | ControlPlaneError::AlreadyExists { .. } => {
                StatusCode::CONFLICT
            }
            ControlPlaneError::DepthExceeded { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ControlPlaneError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ControlPlaneError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), error = %self.0, "Request failed");
        }

        let body = Json(ErrorResponse {
            error: self.0.kind().to_string(),
            message: self.0.to_string(),
        });

        (status, body).into_response()
    }
}

impl From<ControlPlaneError> for ApiError {
    fn from(err: ControlPlaneError) -> Self {
        ApiError(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError(ControlPlaneError::Other(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ControlPlaneError::validation("bad"), StatusCode::BAD_REQUEST),
            (ControlPlaneError::not_found("node", "n1"), StatusCode::NOT_FOUND),
            (ControlPlaneError::conflict("raced"), StatusCode::CONFLICT),
            (
                ControlPlaneError::already_exists("execution", "e1"),
                StatusCode::CONFLICT,
            ),
            (
                ControlPlaneError::DepthExceeded { depth: 4, max: 3 },
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (ControlPlaneError::unavailable("full"), StatusCode::SERVICE_UNAVAILABLE),
            (ControlPlaneError::timeout("agent"), StatusCode::GATEWAY_TIMEOUT),
            (ControlPlaneError::storage("disk"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status_code(), expected);
        }
    }
}
