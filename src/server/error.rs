use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

use crate::error::VaultError;

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

/// Error returned by every handler; renders as `{"error": {"code", "message"}}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "INVALID_INPUT", message)
    }
}

impl From<VaultError> for ApiError {
    fn from(err: VaultError) -> Self {
        let (status, code) = match &err {
            VaultError::PluginNotFound(_) => (StatusCode::NOT_FOUND, "PLUGIN_NOT_FOUND"),
            VaultError::VersionNotFound(_) => (StatusCode::NOT_FOUND, "VERSION_NOT_FOUND"),
            VaultError::TagNotFound { .. } => (StatusCode::NOT_FOUND, "TAG_NOT_FOUND"),
            VaultError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            VaultError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "INVALID_INPUT"),
            VaultError::CorruptPatch { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "CORRUPT_PATCH")
            }
            VaultError::BrokenChain { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "BROKEN_CHAIN"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(code, error = %err, "request failed");
        }
        Self::new(status, code, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            error: ErrorBody {
                code: self.code,
                message: self.message,
            },
        });
        (self.status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (VaultError::VersionNotFound("v-1".into()), StatusCode::NOT_FOUND),
            (VaultError::Conflict("stale".into()), StatusCode::CONFLICT),
            (VaultError::InvalidInput("bad".into()), StatusCode::BAD_REQUEST),
            (
                VaultError::broken("v-1", "snapshot payload missing"),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status, status);
        }
    }
}
