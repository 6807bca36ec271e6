//! Identity provider payloads.
//!
//! These are the request/response bodies of the `/auth/v1/*` surface. The
//! client treats the provider as a black box and depends only on these shapes.
//!
//! # Error bodies
//!
//! Every failed call answers with an [`ErrorBody`] whose `error` field is one
//! of the codes in [`error_codes`]. Clients should branch on the code and only
//! fall back to the message text when the code is unknown.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Role;

/// Profile hints stored with the identity at sign-up.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub role: Option<Role>,
}

/// An identity as seen by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityUser {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub user_metadata: UserMetadata,
    #[serde(default)]
    pub email_confirmed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl IdentityUser {
    pub fn is_confirmed(&self) -> bool {
        self.email_confirmed_at.is_some()
    }
}

/// A bearer session issued by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Lifetime of the access token in seconds.
    pub expires_in: i64,
    /// Expiry as a unix timestamp in seconds.
    pub expires_at: i64,
    pub refresh_token: String,
    pub user: IdentityUser,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

impl Session {
    /// Whether the access token has expired at `now` (unix seconds).
    pub fn is_expired_at(&self, now: i64) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now().timestamp())
    }
}

/// `POST /auth/v1/signup`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignUpRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub data: UserMetadata,
}

/// Response to sign-up. `session` is absent while email confirmation is pending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignUpResponse {
    pub user: IdentityUser,
    #[serde(default)]
    pub session: Option<Session>,
}

/// `POST /auth/v1/token?grant_type=password`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasswordGrant {
    pub email: String,
    pub password: String,
}

/// `POST /auth/v1/token?grant_type=refresh_token`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshGrant {
    pub refresh_token: String,
}

/// `POST /auth/v1/recover`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverRequest {
    pub email: String,
}

/// What a verification token proves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyKind {
    /// Confirms the email of a new identity.
    Signup,
    /// Completes a password reset; requires `password`.
    Recovery,
}

impl VerifyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerifyKind::Signup => "signup",
            VerifyKind::Recovery => "recovery",
        }
    }
}

/// `POST /auth/v1/verify`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyRequest {
    #[serde(rename = "type")]
    pub kind: VerifyKind,
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Error body returned by both the identity and record surfaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

/// Stable error codes carried in [`ErrorBody::error`].
pub mod error_codes {
    pub const INVALID_CREDENTIALS: &str = "invalid_credentials";
    pub const EMAIL_NOT_CONFIRMED: &str = "email_not_confirmed";
    pub const RATE_LIMITED: &str = "over_request_rate_limit";
    pub const USER_ALREADY_EXISTS: &str = "user_already_exists";
    pub const WEAK_PASSWORD: &str = "weak_password";
    pub const VALIDATION_FAILED: &str = "validation_failed";
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const FORBIDDEN: &str = "forbidden";
    pub const NOT_FOUND: &str = "not_found";
    pub const INTERNAL: &str = "internal";
}
