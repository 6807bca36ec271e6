//! Identity provider: accounts, sessions, email confirmation and recovery.
//!
//! Sessions are a pair of tokens:
//! - a short-lived HS256 access token carrying the session id (`sid`)
//! - an opaque refresh token, stored only as a SHA-256 digest and rotated on use
//!
//! Revoking the session row invalidates both. Confirmation and recovery
//! tokens are not mailed anywhere; they are logged at INFO so an operator (or
//! a test) can complete the flow.

mod password;
mod rate_limit;
pub mod store;
pub mod tokens;

pub use password::PasswordHasher;
pub use rate_limit::AttemptLimiter;

use std::sync::Arc;

use axum::http::HeaderMap;
use chrono::Utc;

use site_common::{
    IdentityUser, PasswordGrant, RecoverRequest, RefreshGrant, Session, SignUpRequest,
    SignUpResponse, VerifyKind, VerifyRequest,
};

use crate::auth::{bearer_token, AuthError, AuthUser};
use crate::config::AuthConfig;
use crate::db::Database;
use crate::error::{ApiError, Result};

use tokens::{generate_token, hash_token, TokenSigner};

pub struct IdentityService {
    db: Arc<Database>,
    config: AuthConfig,
    signer: TokenSigner,
    hasher: PasswordHasher,
    limiter: AttemptLimiter,
}

/// Lower-case and trim an email, rejecting obviously malformed input.
pub fn normalize_email(email: &str) -> Result<String> {
    let email = email.trim().to_lowercase();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(email),
        _ => Err(ApiError::Validation(format!("Invalid email address: {}", email))),
    }
}

impl IdentityService {
    pub fn new(db: Arc<Database>, config: AuthConfig, hasher: PasswordHasher) -> Self {
        let signer = TokenSigner::new(&config.jwt_secret, config.access_token_ttl_secs);
        let limiter = AttemptLimiter::per_minute(config.attempts_per_minute);
        Self {
            db,
            config,
            signer,
            hasher,
            limiter,
        }
    }

    fn check_password_strength(&self, password: &str) -> Result<()> {
        if password.chars().count() < self.config.min_password_length {
            return Err(ApiError::WeakPassword(self.config.min_password_length));
        }
        Ok(())
    }

    /// Create an identity. A session is returned only when no confirmation is required.
    pub fn sign_up(&self, request: SignUpRequest) -> Result<SignUpResponse> {
        let email = normalize_email(&request.email)?;
        self.limiter.check(&email)?;
        self.check_password_strength(&request.password)?;

        let password_hash = self.hasher.hash(&request.password)?;
        let now = Utc::now();
        let confirmed_at = (!self.config.require_email_confirmation).then_some(now);

        let user = IdentityUser {
            id: uuid::Uuid::new_v4().to_string(),
            email: email.clone(),
            user_metadata: request.data,
            email_confirmed_at: confirmed_at,
            created_at: now,
        };

        {
            let conn = self.db.conn()?;
            if store::find_by_email(&conn, &email)?.is_some() {
                return Err(ApiError::UserAlreadyExists);
            }
            store::insert_identity(&conn, &user, &password_hash)?;

            if self.config.require_email_confirmation {
                let token = generate_token();
                let expires_at = now.timestamp() + self.config.verification_ttl_secs;
                store::insert_verification(
                    &conn,
                    &hash_token(&token),
                    &user.id,
                    VerifyKind::Signup,
                    expires_at,
                )?;
                tracing::info!(
                    email = %email,
                    token = %token,
                    "Confirmation email queued"
                );
            }
        }

        tracing::info!("Created identity {} ({})", user.id, email);

        let session = if user.is_confirmed() {
            Some(self.create_session(&user)?)
        } else {
            None
        };

        Ok(SignUpResponse { user, session })
    }

    /// Verify email + password and issue a session.
    pub fn sign_in(&self, grant: PasswordGrant) -> Result<Session> {
        let email = normalize_email(&grant.email).map_err(|_| ApiError::InvalidCredentials)?;
        self.limiter.check(&email)?;

        let record = {
            let conn = self.db.conn()?;
            store::find_by_email(&conn, &email)?
        };

        let Some(record) = record else {
            self.hasher.verify_decoy(&grant.password);
            return Err(ApiError::InvalidCredentials);
        };

        if !self.hasher.verify(&grant.password, &record.password_hash)? {
            return Err(ApiError::InvalidCredentials);
        }

        if !record.user.is_confirmed() {
            if !self.config.allow_unconfirmed_login {
                return Err(ApiError::EmailNotConfirmed);
            }
            tracing::warn!(
                "Issuing session to unconfirmed identity {} (allow_unconfirmed_login is set)",
                record.user.id
            );
        }

        self.create_session(&record.user)
    }

    fn create_session(&self, user: &IdentityUser) -> Result<Session> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let refresh_token = generate_token();
        let expires = Utc::now().timestamp() + self.config.refresh_token_ttl_secs;

        {
            let conn = self.db.conn()?;
            store::insert_session(&conn, &session_id, &user.id, &hash_token(&refresh_token), expires)?;
        }

        let (access_token, expires_at) = self.signer.issue(&user.id, &user.email, &session_id)?;
        tracing::debug!("Issued session {} for {}", session_id, user.id);

        Ok(Session {
            access_token,
            token_type: "bearer".to_string(),
            expires_in: self.signer.access_ttl_secs(),
            expires_at,
            refresh_token,
            user: user.clone(),
        })
    }

    /// Exchange a refresh token for a new session pair. The refresh token rotates.
    pub fn refresh(&self, grant: RefreshGrant) -> Result<Session> {
        let now = Utc::now().timestamp();
        let new_refresh = generate_token();

        let (session_id, record) = {
            let conn = self.db.conn()?;
            let Some((session_id, user_id)) =
                store::find_session_by_refresh(&conn, &hash_token(&grant.refresh_token), now)?
            else {
                return Err(ApiError::Unauthorized("Invalid refresh token".to_string()));
            };
            let record = store::find_by_id(&conn, &user_id)?
                .ok_or_else(|| ApiError::Unauthorized("Identity no longer exists".to_string()))?;
            store::rotate_refresh(&conn, &session_id, &hash_token(&new_refresh))?;
            (session_id, record)
        };

        let (access_token, expires_at) =
            self.signer
                .issue(&record.user.id, &record.user.email, &session_id)?;

        Ok(Session {
            access_token,
            token_type: "bearer".to_string(),
            expires_in: self.signer.access_ttl_secs(),
            expires_at,
            refresh_token: new_refresh,
            user: record.user,
        })
    }

    /// Validate the bearer token and confirm its session is still live.
    pub fn authenticate(&self, headers: &HeaderMap) -> std::result::Result<AuthUser, AuthError> {
        let token = bearer_token(headers)?;
        let claims = self.signer.verify(token)?;

        let active = self
            .db
            .conn()
            .and_then(|conn| store::is_session_active(&conn, &claims.sid, Utc::now().timestamp()))
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;

        if !active {
            return Err(AuthError::SessionInactive);
        }

        Ok(AuthUser {
            id: claims.sub,
            email: claims.email,
            session_id: claims.sid,
        })
    }

    /// Optional variant of [`authenticate`](Self::authenticate): no header means anonymous.
    pub fn authenticate_optional(
        &self,
        headers: &HeaderMap,
    ) -> std::result::Result<Option<AuthUser>, AuthError> {
        match self.authenticate(headers) {
            Ok(user) => Ok(Some(user)),
            Err(AuthError::MissingHeader) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn sign_out(&self, user: &AuthUser) -> Result<()> {
        let conn = self.db.conn()?;
        if store::revoke_session(&conn, &user.session_id)? {
            tracing::info!("Revoked session {} for {}", user.session_id, user.id);
        }
        Ok(())
    }

    pub fn get_user(&self, user: &AuthUser) -> Result<IdentityUser> {
        let conn = self.db.conn()?;
        store::find_by_id(&conn, &user.id)?
            .map(|record| record.user)
            .ok_or_else(|| ApiError::NotFound("User not found".to_string()))
    }

    /// Start a password reset. Never reveals whether the address is registered.
    pub fn recover(&self, request: RecoverRequest) -> Result<()> {
        let Ok(email) = normalize_email(&request.email) else {
            return Ok(());
        };
        self.limiter.check(&email)?;

        let conn = self.db.conn()?;
        if let Some(record) = store::find_by_email(&conn, &email)? {
            let token = generate_token();
            let expires_at = Utc::now().timestamp() + self.config.verification_ttl_secs;
            store::insert_verification(
                &conn,
                &hash_token(&token),
                &record.user.id,
                VerifyKind::Recovery,
                expires_at,
            )?;
            tracing::info!(email = %email, token = %token, "Password recovery email queued");
        } else {
            tracing::debug!("Recovery requested for unknown email");
        }
        Ok(())
    }

    /// Complete a signup confirmation or a password recovery and issue a session.
    pub fn verify(&self, request: VerifyRequest) -> Result<Session> {
        let new_hash = match request.kind {
            VerifyKind::Recovery => {
                let password = request.password.as_deref().ok_or_else(|| {
                    ApiError::Validation("A new password is required".to_string())
                })?;
                self.check_password_strength(password)?;
                Some(self.hasher.hash(password)?)
            }
            VerifyKind::Signup => None,
        };

        let record = {
            let conn = self.db.conn()?;
            let user_id = store::take_verification(
                &conn,
                &hash_token(&request.token),
                request.kind,
                Utc::now().timestamp(),
            )?
            .ok_or_else(|| {
                ApiError::Validation("Token has expired or is invalid".to_string())
            })?;

            match &new_hash {
                Some(hash) => {
                    store::update_password(&conn, &user_id, hash)?;
                    let revoked = store::revoke_user_sessions(&conn, &user_id)?;
                    tracing::info!("Password reset for {} ({} sessions revoked)", user_id, revoked);
                    // Completing a recovery proves control of the mailbox.
                    store::confirm_email(&conn, &user_id, Utc::now())?;
                }
                None => {
                    store::confirm_email(&conn, &user_id, Utc::now())?;
                    tracing::info!("Email confirmed for {}", user_id);
                }
            }

            store::find_by_id(&conn, &user_id)?
                .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?
        };

        self.create_session(&record.user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::AUTHORIZATION;
    use site_common::UserMetadata;

    fn service(configure: impl FnOnce(&mut AuthConfig)) -> IdentityService {
        let mut config = AuthConfig::with_secret("test-secret");
        config.require_email_confirmation = false;
        config.attempts_per_minute = 100;
        configure(&mut config);
        IdentityService::new(
            Arc::new(Database::in_memory().unwrap()),
            config,
            PasswordHasher::new(64, 1).unwrap(),
        )
    }

    fn sign_up(service: &IdentityService, email: &str, password: &str) -> SignUpResponse {
        service
            .sign_up(SignUpRequest {
                email: email.to_string(),
                password: password.to_string(),
                data: UserMetadata::default(),
            })
            .unwrap()
    }

    fn bearer(session: &Session) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            format!("Bearer {}", session.access_token).parse().unwrap(),
        );
        headers
    }

    fn grant(email: &str, password: &str) -> PasswordGrant {
        PasswordGrant {
            email: email.to_string(),
            password: password.to_string(),
        }
    }

    #[test]
    fn test_normalize_email() {
        assert_eq!(normalize_email("  A@X.com ").unwrap(), "a@x.com");
        assert!(normalize_email("no-at-sign").is_err());
        assert!(normalize_email("@x.com").is_err());
        assert!(normalize_email("a@localhost").is_err());
    }

    #[test]
    fn test_sign_up_without_confirmation_returns_session() {
        let service = service(|_| {});
        let response = sign_up(&service, "a@x.com", "secret1");
        assert!(response.user.is_confirmed());
        let session = response.session.unwrap();
        let user = service.authenticate(&bearer(&session)).unwrap();
        assert_eq!(user.id, response.user.id);
    }

    #[test]
    fn test_sign_up_with_confirmation_withholds_session() {
        let service = service(|c| c.require_email_confirmation = true);
        let response = sign_up(&service, "a@x.com", "secret1");
        assert!(response.session.is_none());
        assert!(!response.user.is_confirmed());

        let err = service.sign_in(grant("a@x.com", "secret1")).unwrap_err();
        assert!(matches!(err, ApiError::EmailNotConfirmed));
    }

    #[test]
    fn test_unconfirmed_login_allowed_when_configured() {
        let service = service(|c| {
            c.require_email_confirmation = true;
            c.allow_unconfirmed_login = true;
        });
        sign_up(&service, "a@x.com", "secret1");
        assert!(service.sign_in(grant("a@x.com", "secret1")).is_ok());
    }

    #[test]
    fn test_duplicate_sign_up() {
        let service = service(|_| {});
        sign_up(&service, "a@x.com", "secret1");
        let err = service
            .sign_up(SignUpRequest {
                email: "A@x.com".to_string(),
                password: "secret2".to_string(),
                data: UserMetadata::default(),
            })
            .unwrap_err();
        assert!(matches!(err, ApiError::UserAlreadyExists));
    }

    #[test]
    fn test_weak_password() {
        let service = service(|_| {});
        let err = service
            .sign_up(SignUpRequest {
                email: "a@x.com".to_string(),
                password: "123".to_string(),
                data: UserMetadata::default(),
            })
            .unwrap_err();
        assert!(matches!(err, ApiError::WeakPassword(6)));
    }

    #[test]
    fn test_wrong_password_and_unknown_email_look_the_same() {
        let service = service(|_| {});
        sign_up(&service, "a@x.com", "secret1");
        let wrong = service.sign_in(grant("a@x.com", "wrong")).unwrap_err();
        let unknown = service.sign_in(grant("nobody@x.com", "secret1")).unwrap_err();
        assert_eq!(wrong.to_string(), unknown.to_string());
        assert!(matches!(wrong, ApiError::InvalidCredentials));
    }

    #[test]
    fn test_sign_in_rate_limited() {
        let service = service(|c| c.attempts_per_minute = 2);
        sign_up(&service, "a@x.com", "secret1");
        // sign_up consumed one attempt for this email
        let _ = service.sign_in(grant("a@x.com", "wrong"));
        let err = service.sign_in(grant("a@x.com", "secret1")).unwrap_err();
        assert!(matches!(err, ApiError::RateLimited));
    }

    #[test]
    fn test_sign_out_revokes_access_token() {
        let service = service(|_| {});
        sign_up(&service, "a@x.com", "secret1");
        let session = service.sign_in(grant("a@x.com", "secret1")).unwrap();
        let user = service.authenticate(&bearer(&session)).unwrap();

        service.sign_out(&user).unwrap();
        assert!(matches!(
            service.authenticate(&bearer(&session)),
            Err(AuthError::SessionInactive)
        ));
        // idempotent
        service.sign_out(&user).unwrap();
    }

    #[test]
    fn test_refresh_rotates_token() {
        let service = service(|_| {});
        sign_up(&service, "a@x.com", "secret1");
        let session = service.sign_in(grant("a@x.com", "secret1")).unwrap();

        let refreshed = service
            .refresh(RefreshGrant {
                refresh_token: session.refresh_token.clone(),
            })
            .unwrap();
        assert_ne!(refreshed.refresh_token, session.refresh_token);
        assert!(service.authenticate(&bearer(&refreshed)).is_ok());

        let reuse = service.refresh(RefreshGrant {
            refresh_token: session.refresh_token,
        });
        assert!(matches!(reuse, Err(ApiError::Unauthorized(_))));
    }

    #[test]
    fn test_refresh_after_sign_out_fails() {
        let service = service(|_| {});
        sign_up(&service, "a@x.com", "secret1");
        let session = service.sign_in(grant("a@x.com", "secret1")).unwrap();
        let user = service.authenticate(&bearer(&session)).unwrap();
        service.sign_out(&user).unwrap();

        let result = service.refresh(RefreshGrant {
            refresh_token: session.refresh_token,
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_recover_unknown_email_is_silent() {
        let service = service(|_| {});
        assert!(service
            .recover(RecoverRequest {
                email: "nobody@x.com".to_string()
            })
            .is_ok());
        assert!(service
            .recover(RecoverRequest {
                email: "garbage".to_string()
            })
            .is_ok());
    }

    #[test]
    fn test_verify_with_unknown_token() {
        let service = service(|_| {});
        let err = service
            .verify(VerifyRequest {
                kind: VerifyKind::Signup,
                token: "nope".to_string(),
                password: None,
            })
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[test]
    fn test_verify_recovery_requires_password() {
        let service = service(|_| {});
        let err = service
            .verify(VerifyRequest {
                kind: VerifyKind::Recovery,
                token: "whatever".to_string(),
                password: None,
            })
            .unwrap_err();
        assert!(err.to_string().contains("new password"));
    }

    #[test]
    fn test_verify_signup_token_confirms_email() {
        let service = service(|c| c.require_email_confirmation = true);
        let response = sign_up(&service, "a@x.com", "secret1");

        // Plant a known token the way sign_up does.
        {
            let conn = service.db.conn().unwrap();
            store::insert_verification(
                &conn,
                &hash_token("known"),
                &response.user.id,
                VerifyKind::Signup,
                Utc::now().timestamp() + 60,
            )
            .unwrap();
        }

        let session = service
            .verify(VerifyRequest {
                kind: VerifyKind::Signup,
                token: "known".to_string(),
                password: None,
            })
            .unwrap();
        assert!(session.user.is_confirmed());
        assert!(service.sign_in(grant("a@x.com", "secret1")).is_ok());
    }

    #[test]
    fn test_verify_recovery_sets_new_password_and_revokes_sessions() {
        let service = service(|_| {});
        let response = sign_up(&service, "a@x.com", "secret1");
        let old = response.session.unwrap();

        {
            let conn = service.db.conn().unwrap();
            store::insert_verification(
                &conn,
                &hash_token("reset"),
                &response.user.id,
                VerifyKind::Recovery,
                Utc::now().timestamp() + 60,
            )
            .unwrap();
        }

        service
            .verify(VerifyRequest {
                kind: VerifyKind::Recovery,
                token: "reset".to_string(),
                password: Some("brand-new".to_string()),
            })
            .unwrap();

        assert!(service.authenticate(&bearer(&old)).is_err());
        assert!(service.sign_in(grant("a@x.com", "secret1")).is_err());
        assert!(service.sign_in(grant("a@x.com", "brand-new")).is_ok());
    }
}
