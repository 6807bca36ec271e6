//! Mapping of identity provider failures to user-facing categories.

use serde::Serialize;

use site_common::error_codes;

use crate::error::IdentityError;

pub const INVALID_CREDENTIALS_MESSAGE: &str = "Invalid email or password.";
pub const UNCONFIRMED_MESSAGE: &str = "Please confirm your email address before logging in.";
pub const RATE_LIMITED_MESSAGE: &str = "Too many attempts. Please wait a moment and try again.";
pub const DUPLICATE_MESSAGE: &str = "An account with this email already exists.";
pub const TRANSIENT_MESSAGE: &str = "Something went wrong. Please try again.";

/// Failure category of an auth operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthErrorKind {
    InvalidCredentials,
    UnconfirmedIdentity,
    RateLimited,
    DuplicateIdentity,
    /// Network failure or anything the provider reported that has no
    /// dedicated category.
    Transient,
    /// Identity exists but its profile row is missing or stale. Tolerated
    /// silently.
    ProfileInconsistency,
}

impl AuthErrorKind {
    /// The form-level message for this category. `None` for categories that
    /// are never shown.
    pub fn user_message(&self) -> Option<&'static str> {
        match self {
            AuthErrorKind::InvalidCredentials => Some(INVALID_CREDENTIALS_MESSAGE),
            AuthErrorKind::UnconfirmedIdentity => Some(UNCONFIRMED_MESSAGE),
            AuthErrorKind::RateLimited => Some(RATE_LIMITED_MESSAGE),
            AuthErrorKind::DuplicateIdentity => Some(DUPLICATE_MESSAGE),
            AuthErrorKind::Transient => Some(TRANSIENT_MESSAGE),
            AuthErrorKind::ProfileInconsistency => None,
        }
    }
}

/// Classify a provider failure. Error codes win; message text is only
/// consulted when the code is missing or unknown.
pub fn classify(err: &IdentityError) -> AuthErrorKind {
    let (status, code, message) = match err {
        IdentityError::Provider {
            status,
            code,
            message,
        } => (*status, code.as_deref(), message.as_str()),
        IdentityError::Transport(_) | IdentityError::InvalidResponse(_) => {
            return AuthErrorKind::Transient
        }
    };

    if let Some(kind) = code.and_then(from_code) {
        return kind;
    }
    if status == 429 {
        return AuthErrorKind::RateLimited;
    }
    from_message(message)
}

fn from_code(code: &str) -> Option<AuthErrorKind> {
    match code {
        error_codes::INVALID_CREDENTIALS => Some(AuthErrorKind::InvalidCredentials),
        error_codes::EMAIL_NOT_CONFIRMED => Some(AuthErrorKind::UnconfirmedIdentity),
        error_codes::RATE_LIMITED => Some(AuthErrorKind::RateLimited),
        error_codes::USER_ALREADY_EXISTS => Some(AuthErrorKind::DuplicateIdentity),
        _ => None,
    }
}

fn from_message(message: &str) -> AuthErrorKind {
    let message = message.to_lowercase();
    if message.contains("invalid login credentials") || message.contains("invalid credentials") {
        AuthErrorKind::InvalidCredentials
    } else if message.contains("email not confirmed") {
        AuthErrorKind::UnconfirmedIdentity
    } else if message.contains("rate limit") || message.contains("too many requests") {
        AuthErrorKind::RateLimited
    } else if message.contains("already registered") || message.contains("already exists") {
        AuthErrorKind::DuplicateIdentity
    } else {
        AuthErrorKind::Transient
    }
}
