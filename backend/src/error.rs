//! Error types for the backend API.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use site_common::{error_codes, ErrorBody};

/// Errors surfaced by the identity and record endpoints.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Invalid login credentials")]
    InvalidCredentials,

    #[error("Email not confirmed")]
    EmailNotConfirmed,

    #[error("Too many requests, please try again later")]
    RateLimited,

    #[error("User already registered")]
    UserAlreadyExists,

    #[error("Password should be at least {0} characters")]
    WeakPassword(usize),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidCredentials => StatusCode::BAD_REQUEST,
            ApiError::EmailNotConfirmed => StatusCode::BAD_REQUEST,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::UserAlreadyExists => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::WeakPassword(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidCredentials => error_codes::INVALID_CREDENTIALS,
            ApiError::EmailNotConfirmed => error_codes::EMAIL_NOT_CONFIRMED,
            ApiError::RateLimited => error_codes::RATE_LIMITED,
            ApiError::UserAlreadyExists => error_codes::USER_ALREADY_EXISTS,
            ApiError::WeakPassword(_) => error_codes::WEAK_PASSWORD,
            ApiError::Validation(_) => error_codes::VALIDATION_FAILED,
            ApiError::Unauthorized(_) => error_codes::UNAUTHORIZED,
            ApiError::Forbidden(_) => error_codes::FORBIDDEN,
            ApiError::NotFound(_) => error_codes::NOT_FOUND,
            ApiError::Internal(_) => error_codes::INTERNAL,
        }
    }
}

impl From<rusqlite::Error> for ApiError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, msg)
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                ApiError::Validation(
                    msg.clone()
                        .unwrap_or_else(|| "Constraint violation".to_string()),
                )
            }
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(ref msg) = self {
            tracing::error!("Internal error: {}", msg);
        }

        let body = Json(ErrorBody {
            error: self.code().to_string(),
            message: self.to_string(),
        });

        (self.status(), body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ApiError::InvalidCredentials, StatusCode::BAD_REQUEST, "invalid_credentials")]
    #[case(ApiError::EmailNotConfirmed, StatusCode::BAD_REQUEST, "email_not_confirmed")]
    #[case(ApiError::RateLimited, StatusCode::TOO_MANY_REQUESTS, "over_request_rate_limit")]
    #[case(ApiError::UserAlreadyExists, StatusCode::UNPROCESSABLE_ENTITY, "user_already_exists")]
    #[case(ApiError::Unauthorized("x".into()), StatusCode::UNAUTHORIZED, "unauthorized")]
    #[case(ApiError::Forbidden("x".into()), StatusCode::FORBIDDEN, "forbidden")]
    fn test_status_and_code(
        #[case] err: ApiError,
        #[case] status: StatusCode,
        #[case] code: &str,
    ) {
        assert_eq!(err.status(), status);
        assert_eq!(err.code(), code);
    }

    #[test]
    fn test_messages_match_provider_wording() {
        assert_eq!(ApiError::InvalidCredentials.to_string(), "Invalid login credentials");
        assert_eq!(ApiError::EmailNotConfirmed.to_string(), "Email not confirmed");
        assert_eq!(ApiError::UserAlreadyExists.to_string(), "User already registered");
        assert_eq!(
            ApiError::WeakPassword(6).to_string(),
            "Password should be at least 6 characters"
        );
    }

    #[test]
    fn test_constraint_violation_maps_to_validation() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ErrorCode::ConstraintViolation,
                extended_code: 787,
            },
            Some("FOREIGN KEY constraint failed".to_string()),
        );
        let api: ApiError = err.into();
        assert_eq!(api.code(), error_codes::VALIDATION_FAILED);
        assert!(api.to_string().contains("FOREIGN KEY"));
    }
}
