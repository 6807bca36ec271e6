//! Session backends.
//!
//! Two credential sources coexist: the provider session cached locally and a
//! legacy "logged in" record with a fixed lifetime. Both sit behind
//! [`SessionProvider`] and are ordered by configuration in a [`SessionChain`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use site_common::Session;

use super::AuthEvent;
use crate::error::{SetupError, StorageError};
use crate::identity::IdentityProvider;
use crate::records::RecordStore;
use crate::storage::{get_json, set_json, LocalStorage};

pub const LEGACY_SESSION_KEY: &str = "auth.legacy_session";
pub const PROVIDER_SESSION_KEY: &str = "auth.session";

/// What a successful sign-in hands to every backend.
#[derive(Debug, Clone)]
pub struct SessionGrant {
    pub session: Session,
    pub username: String,
}

#[async_trait]
pub trait SessionProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this backend currently holds a valid session.
    async fn check(&self) -> bool;

    async fn issue(&self, grant: &SessionGrant) -> Result<(), StorageError>;

    /// Drop this backend's session. Idempotent.
    async fn revoke(&self) -> Result<(), StorageError>;
}

/// Legacy local session record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacySession {
    pub logged_in: bool,
    pub username: String,
    pub issued_at_ms: i64,
}

impl LegacySession {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            logged_in: true,
            username: username.into(),
            issued_at_ms: Utc::now().timestamp_millis(),
        }
    }

    pub fn is_valid_at(&self, now_ms: i64, ttl: chrono::Duration) -> bool {
        self.logged_in && now_ms - self.issued_at_ms <= ttl.num_milliseconds()
    }
}

/// Local record with a fixed lifetime. A valid record answers `check`
/// without contacting the provider.
pub struct LegacySessionProvider {
    storage: Arc<dyn LocalStorage>,
    ttl: chrono::Duration,
}

impl LegacySessionProvider {
    pub fn new(storage: Arc<dyn LocalStorage>, ttl: chrono::Duration) -> Self {
        Self { storage, ttl }
    }

    /// The stored record, if it is still valid.
    pub fn current(&self) -> Option<LegacySession> {
        match get_json::<LegacySession>(self.storage.as_ref(), LEGACY_SESSION_KEY) {
            Ok(Some(record)) if record.is_valid_at(Utc::now().timestamp_millis(), self.ttl) => {
                Some(record)
            }
            Ok(Some(_)) => {
                tracing::debug!("Legacy session expired, removing it");
                self.discard();
                None
            }
            Ok(None) => None,
            Err(StorageError::Serialization(e)) => {
                tracing::warn!("Discarding unreadable legacy session: {}", e);
                self.discard();
                None
            }
            Err(e) => {
                tracing::warn!("Failed to read legacy session: {}", e);
                None
            }
        }
    }

    fn discard(&self) {
        if let Err(e) = self.storage.remove(LEGACY_SESSION_KEY) {
            tracing::warn!("Failed to remove legacy session: {}", e);
        }
    }
}

#[async_trait]
impl SessionProvider for LegacySessionProvider {
    fn name(&self) -> &'static str {
        "legacy"
    }

    async fn check(&self) -> bool {
        self.current().is_some()
    }

    async fn issue(&self, grant: &SessionGrant) -> Result<(), StorageError> {
        set_json(
            self.storage.as_ref(),
            LEGACY_SESSION_KEY,
            &LegacySession::new(grant.username.clone()),
        )
    }

    async fn revoke(&self) -> Result<(), StorageError> {
        self.storage.remove(LEGACY_SESSION_KEY)
    }
}

/// The identity provider's session, cached locally and refreshed on expiry.
///
/// Whenever a session is loaded its access token is handed to the record
/// store, so writes carry the caller's bearer.
pub struct ProviderSessionProvider {
    identity: Arc<dyn IdentityProvider>,
    records: Arc<dyn RecordStore>,
    storage: Arc<dyn LocalStorage>,
    events: broadcast::Sender<AuthEvent>,
}

impl ProviderSessionProvider {
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        records: Arc<dyn RecordStore>,
        storage: Arc<dyn LocalStorage>,
        events: broadcast::Sender<AuthEvent>,
    ) -> Self {
        Self {
            identity,
            records,
            storage,
            events,
        }
    }

    fn cached(&self) -> Option<Session> {
        match get_json::<Session>(self.storage.as_ref(), PROVIDER_SESSION_KEY) {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!("Discarding unreadable provider session: {}", e);
                self.forget();
                None
            }
        }
    }

    /// The live session, refreshing an expired access token once. A failed
    /// refresh clears the cache.
    pub async fn session(&self) -> Option<Session> {
        let session = self.cached()?;
        if !session.is_expired() {
            self.records.set_access_token(Some(session.access_token.clone()));
            return Some(session);
        }

        tracing::debug!("Access token expired, refreshing session for {}", session.user.id);
        match self.identity.refresh_session(&session.refresh_token).await {
            Ok(refreshed) => {
                if let Err(e) = set_json(self.storage.as_ref(), PROVIDER_SESSION_KEY, &refreshed) {
                    tracing::warn!("Failed to cache refreshed session: {}", e);
                }
                self.records
                    .set_access_token(Some(refreshed.access_token.clone()));
                let _ = self.events.send(AuthEvent::TokenRefreshed);
                Some(refreshed)
            }
            Err(e) => {
                tracing::warn!("Session refresh failed: {}", e);
                self.forget();
                None
            }
        }
    }

    /// Drop the cached session without telling the provider.
    pub fn forget(&self) {
        if let Err(e) = self.storage.remove(PROVIDER_SESSION_KEY) {
            tracing::warn!("Failed to remove cached session: {}", e);
        }
        self.records.set_access_token(None);
    }
}

#[async_trait]
impl SessionProvider for ProviderSessionProvider {
    fn name(&self) -> &'static str {
        "provider"
    }

    async fn check(&self) -> bool {
        self.session().await.is_some()
    }

    async fn issue(&self, grant: &SessionGrant) -> Result<(), StorageError> {
        set_json(self.storage.as_ref(), PROVIDER_SESSION_KEY, &grant.session)?;
        self.records
            .set_access_token(Some(grant.session.access_token.clone()));
        Ok(())
    }

    async fn revoke(&self) -> Result<(), StorageError> {
        if let Some(session) = self.cached() {
            if let Err(e) = self.identity.sign_out(&session.access_token).await {
                tracing::warn!("Provider sign-out failed, clearing local session anyway: {}", e);
            }
        }
        self.records.set_access_token(None);
        self.storage.remove(PROVIDER_SESSION_KEY)
    }
}

/// Session backends in configured order.
pub struct SessionChain {
    providers: Vec<Arc<dyn SessionProvider>>,
}

impl SessionChain {
    pub fn new(providers: Vec<Arc<dyn SessionProvider>>) -> Self {
        Self { providers }
    }

    /// Build the chain from backend names (`legacy`, `provider`).
    pub fn from_config(
        names: &[String],
        legacy: Arc<LegacySessionProvider>,
        provider: Arc<ProviderSessionProvider>,
    ) -> Result<Self, SetupError> {
        if names.is_empty() {
            return Err(SetupError::NoSessionBackends);
        }
        let providers = names
            .iter()
            .map(|name| match name.trim() {
                "legacy" => Ok(legacy.clone() as Arc<dyn SessionProvider>),
                "provider" => Ok(provider.clone() as Arc<dyn SessionProvider>),
                other => Err(SetupError::UnknownSessionBackend(other.to_string())),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(providers))
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// Name of the first backend reporting a valid session.
    pub async fn check(&self) -> Option<&'static str> {
        for provider in &self.providers {
            if provider.check().await {
                return Some(provider.name());
            }
        }
        None
    }

    /// Issue on every backend. Stops at the first failure.
    pub async fn issue(&self, grant: &SessionGrant) -> Result<(), StorageError> {
        for provider in &self.providers {
            provider.issue(grant).await?;
        }
        Ok(())
    }

    /// Revoke on every backend, logging failures.
    pub async fn revoke(&self) {
        for provider in &self.providers {
            if let Err(e) = provider.revoke().await {
                tracing::warn!("Failed to revoke {} session: {}", provider.name(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::test_util::{FakeIdentity, FakeRecordStore};

    fn legacy(storage: Arc<MemoryStorage>) -> LegacySessionProvider {
        LegacySessionProvider::new(storage, chrono::Duration::hours(24))
    }

    fn provider(
        identity: Arc<FakeIdentity>,
        records: Arc<FakeRecordStore>,
        storage: Arc<MemoryStorage>,
    ) -> ProviderSessionProvider {
        let (events, _) = broadcast::channel(8);
        ProviderSessionProvider::new(identity, records, storage, events)
    }

    fn write_legacy(storage: &MemoryStorage, age: chrono::Duration) {
        let record = LegacySession {
            logged_in: true,
            username: "ann".to_string(),
            issued_at_ms: (Utc::now() - age).timestamp_millis(),
        };
        set_json(storage, LEGACY_SESSION_KEY, &record).unwrap();
    }

    #[tokio::test]
    async fn test_legacy_fresh_record_is_valid() {
        let storage = Arc::new(MemoryStorage::new());
        write_legacy(&storage, chrono::Duration::hours(23));
        assert!(legacy(storage.clone()).check().await);
        assert!(storage.get(LEGACY_SESSION_KEY).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_legacy_expired_record_is_removed() {
        let storage = Arc::new(MemoryStorage::new());
        write_legacy(&storage, chrono::Duration::hours(25));
        assert!(!legacy(storage.clone()).check().await);
        assert!(storage.get(LEGACY_SESSION_KEY).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_legacy_corrupt_or_logged_out_record_is_removed() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set(LEGACY_SESSION_KEY, "not json").unwrap();
        assert!(!legacy(storage.clone()).check().await);
        assert!(storage.get(LEGACY_SESSION_KEY).unwrap().is_none());

        let record = LegacySession {
            logged_in: false,
            username: "ann".to_string(),
            issued_at_ms: Utc::now().timestamp_millis(),
        };
        set_json(storage.as_ref(), LEGACY_SESSION_KEY, &record).unwrap();
        assert!(!legacy(storage.clone()).check().await);
        assert!(storage.get(LEGACY_SESSION_KEY).unwrap().is_none());
    }

    #[test]
    fn test_legacy_validity_boundary() {
        let ttl = chrono::Duration::hours(24);
        let record = LegacySession {
            logged_in: true,
            username: String::new(),
            issued_at_ms: 0,
        };
        assert!(record.is_valid_at(ttl.num_milliseconds(), ttl));
        assert!(!record.is_valid_at(ttl.num_milliseconds() + 1, ttl));
    }

    #[tokio::test]
    async fn test_provider_refreshes_expired_session_once() {
        let identity = Arc::new(FakeIdentity::new());
        let records = Arc::new(FakeRecordStore::new());
        let storage = Arc::new(MemoryStorage::new());
        identity.add_account("a@x.com", "secret1", Default::default(), true);
        identity.set_session_ttl(-10);
        let session = identity.sign_in_with_password("a@x.com", "secret1").await.unwrap();
        identity.set_session_ttl(3600);

        let provider = provider(identity.clone(), records.clone(), storage.clone());
        provider
            .issue(&SessionGrant {
                session: session.clone(),
                username: "ann".to_string(),
            })
            .await
            .unwrap();

        let refreshed = provider.session().await.unwrap();
        assert_ne!(refreshed.access_token, session.access_token);
        assert_eq!(identity.refresh_calls(), 1);
        assert_eq!(records.access_token(), Some(refreshed.access_token.clone()));

        // Cached refreshed session is live; no second refresh.
        assert!(provider.check().await);
        assert_eq!(identity.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn test_provider_failed_refresh_clears_cache() {
        let identity = Arc::new(FakeIdentity::new());
        let records = Arc::new(FakeRecordStore::new());
        let storage = Arc::new(MemoryStorage::new());
        identity.add_account("a@x.com", "secret1", Default::default(), true);
        identity.set_session_ttl(-10);
        let session = identity.sign_in_with_password("a@x.com", "secret1").await.unwrap();
        identity.revoke_all();

        let provider = provider(identity.clone(), records.clone(), storage.clone());
        provider
            .issue(&SessionGrant {
                session,
                username: "ann".to_string(),
            })
            .await
            .unwrap();

        assert!(!provider.check().await);
        assert!(storage.get(PROVIDER_SESSION_KEY).unwrap().is_none());
        assert_eq!(records.access_token(), None);
    }

    #[tokio::test]
    async fn test_provider_revoke_swallows_sign_out_failure() {
        let identity = Arc::new(FakeIdentity::new());
        let records = Arc::new(FakeRecordStore::new());
        let storage = Arc::new(MemoryStorage::new());
        identity.add_account("a@x.com", "secret1", Default::default(), true);
        let session = identity.sign_in_with_password("a@x.com", "secret1").await.unwrap();

        let provider = provider(identity.clone(), records.clone(), storage.clone());
        provider
            .issue(&SessionGrant {
                session,
                username: "ann".to_string(),
            })
            .await
            .unwrap();

        identity.set_failing(true);
        provider.revoke().await.unwrap();
        assert!(storage.get(PROVIDER_SESSION_KEY).unwrap().is_none());
        provider.revoke().await.unwrap();
    }

    #[tokio::test]
    async fn test_chain_from_config() {
        let identity = Arc::new(FakeIdentity::new());
        let records = Arc::new(FakeRecordStore::new());
        let storage = Arc::new(MemoryStorage::new());
        let legacy = Arc::new(legacy(storage.clone()));
        let provider = Arc::new(provider(identity, records, storage.clone()));

        let names = vec!["provider".to_string(), "legacy".to_string()];
        let chain = SessionChain::from_config(&names, legacy.clone(), provider.clone()).unwrap();
        assert_eq!(chain.names(), vec!["provider", "legacy"]);

        let err = SessionChain::from_config(&["cookie".to_string()], legacy.clone(), provider.clone());
        assert!(matches!(err, Err(SetupError::UnknownSessionBackend(name)) if name == "cookie"));
        assert!(matches!(
            SessionChain::from_config(&[], legacy, provider),
            Err(SetupError::NoSessionBackends)
        ));
    }

    #[tokio::test]
    async fn test_chain_check_short_circuits_on_legacy() {
        let identity = Arc::new(FakeIdentity::new());
        let records = Arc::new(FakeRecordStore::new());
        let storage = Arc::new(MemoryStorage::new());
        write_legacy(&storage, chrono::Duration::minutes(5));

        let chain = SessionChain::from_config(
            &["legacy".to_string(), "provider".to_string()],
            Arc::new(legacy(storage.clone())),
            Arc::new(provider(identity.clone(), records, storage.clone())),
        )
        .unwrap();

        identity.set_failing(true);
        assert_eq!(chain.check().await, Some("legacy"));
    }
}
