//! JSON error responses

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use picontrol_core::{AuthError, DirectoryError, ProxyError, Unauthorized};

/// Every failure a handler can return to a client
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    UpstreamUnreachable(String),

    #[error("{0}")]
    Persistence(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::UpstreamUnreachable(_) | ApiError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn missing(field: &str) -> Self {
        ApiError::Validation(format!("Missing required field: {}", field))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("{}", self);
        }

        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<Unauthorized> for ApiError {
    fn from(_: Unauthorized) -> Self {
        ApiError::Unauthorized
    }
}

impl From<DirectoryError> for ApiError {
    fn from(e: DirectoryError) -> Self {
        match e {
            DirectoryError::NotFound(_) => ApiError::NotFound("Device not found".to_string()),
            DirectoryError::Persistence(e) => ApiError::Persistence(e.to_string()),
        }
    }
}

impl From<ProxyError> for ApiError {
    fn from(e: ProxyError) -> Self {
        if e.is_validation() {
            ApiError::Validation(e.to_string())
        } else {
            ApiError::UpstreamUnreachable(e.to_string())
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::InvalidCredentials | AuthError::Rejected => ApiError::Unauthorized,
            other => ApiError::Persistence(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use picontrol_core::StoreError;

    #[test]
    fn test_status_codes() {
        assert_eq!(ApiError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::missing("ip").status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::UpstreamUnreachable("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_store_message_passes_through() {
        let err: ApiError = DirectoryError::Persistence(StoreError::BadRequest(
            "Failed to create record. (device_name: Value must be unique.)".to_string(),
        ))
        .into();

        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.to_string().contains("Value must be unique"));
    }

    #[test]
    fn test_proxy_validation_is_bad_request() {
        let err: ApiError = ProxyError::InvalidTarget("a/b".into()).into();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }
}
