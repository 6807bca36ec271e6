//! Single entry point for "who is signed in, and with what role".

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use site_common::{IdentityUser, NewProfile, Role, Session, SignUpRequest, UserMetadata, UserProfile};

use super::errors::{classify, AuthErrorKind};
use super::session::{
    LegacySessionProvider, ProviderSessionProvider, SessionChain, SessionGrant, SessionProvider,
};
use super::AuthEvent;
use crate::config::Config;
use crate::error::SetupError;
use crate::identity::IdentityProvider;
use crate::reconcile::ProfileJournal;
use crate::records::{ProfileRepository, RecordStore};
use crate::storage::LocalStorage;

pub const ACCOUNT_CREATED_MESSAGE: &str = "Account created successfully.";
pub const CONFIRMATION_PENDING_MESSAGE: &str =
    "Account created. Please check your email to confirm your account.";
pub const PROFILE_PENDING_MESSAGE: &str =
    "Your profile is pending and will be completed automatically.";

#[derive(Debug, Clone, Default, Serialize)]
pub struct LoginOutcome {
    pub success: bool,
    pub user: Option<IdentityUser>,
    pub is_admin: Option<bool>,
    pub error: Option<String>,
    pub kind: Option<AuthErrorKind>,
}

impl LoginOutcome {
    fn failed(kind: AuthErrorKind) -> Self {
        Self {
            error: kind.user_message().map(str::to_string),
            kind: Some(kind),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RegisterOutcome {
    pub success: bool,
    pub user: Option<IdentityUser>,
    pub message: Option<String>,
    pub error: Option<String>,
    pub kind: Option<AuthErrorKind>,
    /// The provider withheld a session until the email is confirmed.
    pub confirmation_pending: bool,
    /// The profile row could not be written and is queued for reconciliation.
    pub profile_pending: bool,
}

impl RegisterOutcome {
    fn failed(kind: AuthErrorKind) -> Self {
        Self {
            error: kind.user_message().map(str::to_string),
            kind: Some(kind),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResetOutcome {
    pub success: bool,
    pub error: Option<String>,
    pub kind: Option<AuthErrorKind>,
}

/// The live identity merged with its profile row.
#[derive(Debug, Clone, Serialize)]
pub struct UserWithProfile {
    pub user: IdentityUser,
    /// `None` when the profile lookup failed or the row is missing.
    pub profile: Option<UserProfile>,
}

impl UserWithProfile {
    pub fn role(&self) -> Role {
        self.profile.as_ref().map(|p| p.role).unwrap_or_default()
    }
}

/// Normalizes the configured session backends into one authentication state.
pub struct AuthFacade {
    identity: Arc<dyn IdentityProvider>,
    records: Arc<dyn RecordStore>,
    profiles: ProfileRepository,
    journal: ProfileJournal,
    legacy: Arc<LegacySessionProvider>,
    provider: Arc<ProviderSessionProvider>,
    sessions: SessionChain,
    events: broadcast::Sender<AuthEvent>,
}

impl AuthFacade {
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        records: Arc<dyn RecordStore>,
        storage: Arc<dyn LocalStorage>,
        config: &Config,
    ) -> Result<Self, SetupError> {
        config.validate()?;
        let (events, _) = broadcast::channel(32);
        // Bounded by validate().
        let ttl = chrono::Duration::hours(config.session.legacy_ttl_hours as i64);

        let legacy = Arc::new(LegacySessionProvider::new(storage.clone(), ttl));
        let provider = Arc::new(ProviderSessionProvider::new(
            identity.clone(),
            records.clone(),
            storage.clone(),
            events.clone(),
        ));
        let sessions =
            SessionChain::from_config(&config.session.backends, legacy.clone(), provider.clone())?;

        tracing::debug!("Session backends: {:?}", sessions.names());

        Ok(Self {
            profiles: ProfileRepository::new(records.clone()),
            journal: ProfileJournal::new(storage),
            identity,
            records,
            legacy,
            provider,
            sessions,
            events,
        })
    }

    pub fn profiles(&self) -> &ProfileRepository {
        &self.profiles
    }

    pub fn journal(&self) -> &ProfileJournal {
        &self.journal
    }

    /// Whether any configured backend holds a valid session.
    pub async fn is_authenticated(&self) -> bool {
        self.sessions.check().await.is_some()
    }

    pub async fn login(&self, email: &str, password: &str) -> LoginOutcome {
        let session = match self.identity.sign_in_with_password(email, password).await {
            Ok(session) => session,
            Err(e) => {
                let kind = classify(&e);
                tracing::info!("Login failed ({:?}): {}", kind, e);
                return LoginOutcome::failed(kind);
            }
        };

        self.records
            .set_access_token(Some(session.access_token.clone()));
        let profile = self.ensure_profile(&session.user).await;
        let role = profile.as_ref().map(|p| p.role).unwrap_or_default();

        let username = profile
            .as_ref()
            .map(|p| p.username.clone())
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| fallback_username(&session.user));
        if let Err(e) = self.start_session(session.clone(), username).await {
            tracing::error!("Failed to store session: {}", e);
            return LoginOutcome::failed(AuthErrorKind::Transient);
        }

        tracing::info!("Signed in {} as {}", session.user.id, role);

        LoginOutcome {
            success: true,
            user: Some(session.user),
            is_admin: Some(role.is_admin()),
            ..Default::default()
        }
    }

    /// Create the identity, then its profile row.
    ///
    /// A failed profile write does not fail registration; the profile is
    /// journaled and created later by the reconciler or the next login.
    pub async fn register(
        &self,
        email: &str,
        password: &str,
        name: &str,
        username: &str,
        role: Role,
    ) -> RegisterOutcome {
        let request = SignUpRequest {
            email: email.to_string(),
            password: password.to_string(),
            data: UserMetadata {
                name: name.to_string(),
                username: username.to_string(),
                role: Some(role),
            },
        };
        let response = match self.identity.sign_up(&request).await {
            Ok(response) => response,
            Err(e) => {
                let kind = classify(&e);
                tracing::info!("Registration failed ({:?}): {}", kind, e);
                return RegisterOutcome::failed(kind);
            }
        };

        let user = response.user;
        if let Some(session) = &response.session {
            self.records
                .set_access_token(Some(session.access_token.clone()));
        }

        let profile = NewProfile {
            id: user.id.clone(),
            email: user.email.clone(),
            name: name.to_string(),
            username: username.to_string(),
            role,
        };
        let profile_pending = match self.profiles.upsert(&profile).await {
            Ok(_) => false,
            Err(e) => {
                tracing::warn!("Profile write for {} failed, queueing it: {}", user.id, e);
                if let Err(e) = self.journal.record(&profile) {
                    tracing::error!("Failed to journal profile {}: {}", user.id, e);
                }
                true
            }
        };

        let confirmation_pending = response.session.is_none();
        if let Some(session) = response.session {
            if let Err(e) = self.start_session(session, username.to_string()).await {
                tracing::warn!("Registered {} but could not store the session: {}", user.id, e);
            }
        }

        let mut message = if confirmation_pending {
            CONFIRMATION_PENDING_MESSAGE.to_string()
        } else {
            ACCOUNT_CREATED_MESSAGE.to_string()
        };
        if profile_pending {
            message.push(' ');
            message.push_str(PROFILE_PENDING_MESSAGE);
        }

        RegisterOutcome {
            success: true,
            user: Some(user),
            message: Some(message),
            confirmation_pending,
            profile_pending,
            ..Default::default()
        }
    }

    /// Clear every session backend, configured or not. Idempotent.
    pub async fn logout(&self) {
        self.sessions.revoke().await;

        // Backends outside the chain may hold records from an earlier configuration.
        let configured = self.sessions.names();
        let leftovers: [(Arc<dyn SessionProvider>, &str); 2] = [
            (self.legacy.clone(), "legacy"),
            (self.provider.clone(), "provider"),
        ];
        for (provider, name) in leftovers {
            if configured.contains(&name) {
                continue;
            }
            if let Err(e) = provider.revoke().await {
                tracing::warn!("Failed to clear {} session: {}", name, e);
            }
        }
        self.records.set_access_token(None);
        let _ = self.events.send(AuthEvent::SignedOut);
    }

    /// Request a reset email. Success says nothing about whether the email
    /// has an account.
    pub async fn reset_password(&self, email: &str) -> ResetOutcome {
        match self.identity.reset_password_for_email(email).await {
            Ok(()) => ResetOutcome {
                success: true,
                ..Default::default()
            },
            Err(e) => {
                let kind = match classify(&e) {
                    AuthErrorKind::RateLimited => AuthErrorKind::RateLimited,
                    _ => AuthErrorKind::Transient,
                };
                tracing::info!("Password reset request failed: {}", e);
                ResetOutcome {
                    success: false,
                    error: kind.user_message().map(str::to_string),
                    kind: Some(kind),
                }
            }
        }
    }

    /// The provider identity and its profile. `None` without a provider
    /// session, including when only the legacy record is valid.
    pub async fn current_user_with_profile(&self) -> Option<UserWithProfile> {
        let session = self.provider.session().await?;

        let user = match self.identity.get_user(&session.access_token).await {
            Ok(user) => user,
            Err(e) if e.status() == Some(401) => {
                tracing::info!("Provider rejected the cached session: {}", e);
                self.provider.forget();
                let _ = self.events.send(AuthEvent::SignedOut);
                return None;
            }
            Err(e) => {
                tracing::warn!("Could not refresh identity, using cached user: {}", e);
                session.user
            }
        };

        let profile = match self.profiles.get(&user.id).await {
            Ok(profile) => profile,
            Err(e) => {
                tracing::warn!("Profile lookup for {} failed: {}", user.id, e);
                None
            }
        };
        if profile.is_none() {
            tracing::debug!("{:?} for {}", AuthErrorKind::ProfileInconsistency, user.id);
        }

        Some(UserWithProfile { user, profile })
    }

    /// Role of the current user; [`Role::User`] when it cannot be resolved.
    pub async fn role(&self) -> Role {
        self.current_user_with_profile()
            .await
            .map(|u| u.role())
            .unwrap_or_default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    async fn start_session(
        &self,
        session: Session,
        username: String,
    ) -> Result<(), crate::error::StorageError> {
        let user_id = session.user.id.clone();
        let access_token = session.access_token.clone();
        if let Err(e) = self.sessions.issue(&SessionGrant { session, username }).await {
            // Undo backends that were written before the failure.
            self.sessions.revoke().await;
            if let Err(e) = self.identity.sign_out(&access_token).await {
                tracing::debug!("Sign-out after failed session write: {}", e);
            }
            self.records.set_access_token(None);
            return Err(e);
        }
        let _ = self.events.send(AuthEvent::SignedIn { user_id });
        Ok(())
    }

    /// Create the profile row if it is missing and read it back. Failures are
    /// logged and yield `None`.
    async fn ensure_profile(&self, user: &IdentityUser) -> Option<UserProfile> {
        let journaled = match self.journal.get(&user.id) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("Failed to read profile journal: {}", e);
                None
            }
        };
        let candidate = journaled.unwrap_or_else(|| profile_from_identity(user));

        match self.profiles.create_if_missing(&candidate).await {
            Ok(created) => {
                if created {
                    tracing::info!("Created missing profile for {}", user.id);
                }
                if let Err(e) = self.journal.remove(&user.id) {
                    tracing::warn!("Failed to clear journal entry for {}: {}", user.id, e);
                }
            }
            Err(e) => tracing::warn!("Profile upsert for {} failed: {}", user.id, e),
        }

        match self.profiles.get(&user.id).await {
            Ok(Some(profile)) => Some(profile),
            Ok(None) => {
                tracing::warn!("No profile row for {}, defaulting to user role", user.id);
                None
            }
            Err(e) => {
                tracing::warn!("Profile lookup for {} failed: {}", user.id, e);
                None
            }
        }
    }
}

fn fallback_username(user: &IdentityUser) -> String {
    if !user.user_metadata.username.is_empty() {
        return user.user_metadata.username.clone();
    }
    user.email
        .split('@')
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Profile derived from the identity's sign-up metadata.
fn profile_from_identity(user: &IdentityUser) -> NewProfile {
    NewProfile {
        id: user.id.clone(),
        email: user.email.clone(),
        name: user.user_metadata.name.clone(),
        username: fallback_username(user),
        role: user.user_metadata.role.unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn identity_user(username: &str, role: Option<Role>) -> IdentityUser {
        IdentityUser {
            id: "u1".to_string(),
            email: "ann@x.com".to_string(),
            user_metadata: UserMetadata {
                name: "Ann".to_string(),
                username: username.to_string(),
                role,
            },
            email_confirmed_at: Some(Utc::now()),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_profile_from_identity_uses_metadata() {
        let profile = profile_from_identity(&identity_user("annie", Some(Role::Admin)));
        assert_eq!(profile.username, "annie");
        assert_eq!(profile.role, Role::Admin);
    }

    #[test]
    fn test_profile_from_identity_falls_back_to_email() {
        let profile = profile_from_identity(&identity_user("", None));
        assert_eq!(profile.username, "ann");
        assert_eq!(profile.role, Role::User);
    }

    #[test]
    fn test_role_defaults_without_profile() {
        let merged = UserWithProfile {
            user: identity_user("ann", Some(Role::Admin)),
            profile: None,
        };
        assert_eq!(merged.role(), Role::User);
    }
}
