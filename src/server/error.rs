//! JSON error responses for the HTTP API.

use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::error::ShiftError;

/// Handler error; every failure is rendered as `{success: false, message, code}`.
#[derive(Debug)]
pub struct ApiError(pub ShiftError);

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self(ShiftError::InvalidRequest(message.into()))
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// The message shown to callers; request errors carry their text as is.
    pub fn message(&self) -> String {
        match &self.0 {
            ShiftError::InvalidRequest(msg)
            | ShiftError::NotFound(msg)
            | ShiftError::SchemaMismatch(msg)
            | ShiftError::Connection(msg) => msg.clone(),
            other => other.to_string(),
        }
    }
}

impl From<ShiftError> for ApiError {
    fn from(err: ShiftError) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        } else {
            tracing::warn!(error = %self.0, status = status.as_u16(), "request rejected");
        }

        let body = json!({
            "success": false,
            "message": self.message(),
            "code": self.0.code(),
        });
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ApiError::bad_request("x").status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError(ShiftError::Connection("down".into())).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError(ShiftError::InvalidTransition {
                from: "completed".into(),
                to: "cancelled".into()
            })
            .status(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn test_request_messages_are_bare() {
        assert_eq!(ApiError::bad_request("Missing schema name").message(), "Missing schema name");
        assert!(ApiError(ShiftError::Cancelled("stop".into())).message().starts_with("Cancelled"));
    }
}
