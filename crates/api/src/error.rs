//! API error type and HTTP mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::{email::EmailError, store::StoreError, validation::FieldError};

pub type ApiResult<T> = Result<T, ApiError>;

/// Every failure the engine can surface.
///
/// All variants except `EmailDelivery` and `Store` are client-correctable.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("This email or username has already been registered")]
    DuplicateAccount,
    #[error("Verification code is invalid")]
    InvalidCode,
    #[error("Invalid email/username or password")]
    InvalidCredentials,
    /// Missing, invalid, expired or superseded access token
    #[error("{0}")]
    Unauthorized(&'static str),
    /// Missing, invalid or expired refresh token
    #[error("{0}")]
    BadRequest(&'static str),
    #[error("Invalid input")]
    Validation(Vec<FieldError>),
    #[error("Verification email could not be sent, please try again later")]
    EmailDelivery(#[from] EmailError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::DuplicateAccount => StatusCode::CONFLICT,
            ApiError::InvalidCode | ApiError::InvalidCredentials | ApiError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::EmailDelivery(_) => StatusCode::BAD_GATEWAY,
            ApiError::Store(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        let body = match &self {
            ApiError::Store(err) => {
                tracing::error!(error = ?err, "Credential store failure");
                json!({ "error": "Internal server error", "code": status.as_u16() })
            }
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                json!({ "error": "Internal server error", "code": status.as_u16() })
            }
            ApiError::EmailDelivery(err) => {
                tracing::error!(error = %err, "Verification email delivery failed");
                json!({ "error": self.to_string(), "code": status.as_u16() })
            }
            ApiError::Validation(fields) => json!({
                "error": self.to_string(),
                "code": status.as_u16(),
                "fields": fields,
            }),
            _ => json!({ "error": self.to_string(), "code": status.as_u16() }),
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ApiError::DuplicateAccount.status(), StatusCode::CONFLICT);
        assert_eq!(ApiError::InvalidCode.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::InvalidCredentials.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::Unauthorized("Access token expired").status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::BadRequest("Invalid refresh token").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Store(StoreError::Aborted("x".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_messages_are_passed_through() {
        assert_eq!(
            ApiError::BadRequest("Refresh token expired").to_string(),
            "Refresh token expired"
        );
    }
}
