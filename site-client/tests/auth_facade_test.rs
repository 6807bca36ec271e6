use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use site_client::auth::errors::{
    DUPLICATE_MESSAGE, INVALID_CREDENTIALS_MESSAGE, RATE_LIMITED_MESSAGE, TRANSIENT_MESSAGE,
    UNCONFIRMED_MESSAGE,
};
use site_client::auth::guard::Redirect;
use site_client::auth::session::{LegacySession, LEGACY_SESSION_KEY, PROVIDER_SESSION_KEY};
use site_client::auth::{AuthErrorKind, AuthEvent, GuardState, GuardWatcher, RoleRequirement, RouteGuard};
use site_client::config::Config;
use site_client::reconcile::{ProfileReconciler, ReconcileReport};
use site_client::records::{PostRepository, ProfileRepository};
use site_client::storage::{get_json, set_json};
use site_client::test_util::{
    test_client, test_client_with, FakeIdentity, FakeRecordStore, TestClient,
};
use site_client::{AuthFacade, LocalStorage, MemoryStorage, StorageError};
use site_common::{NewPost, NewProfile, PostPatch, Role, Table};

fn provider_only() -> Config {
    let mut config = Config::default();
    config.session.backends = vec!["provider".to_string()];
    config
}

async fn register_and_login(client: &TestClient, email: &str, role: Role) -> bool {
    let registered = client
        .facade
        .register(email, "secret1", "Ann", "ann", role)
        .await;
    assert!(registered.success, "{:?}", registered);
    client.facade.logout().await;

    let outcome = client.facade.login(email, "secret1").await;
    assert!(outcome.success, "{:?}", outcome);
    outcome.is_admin.unwrap()
}

fn write_legacy(client: &TestClient, age: chrono::Duration) {
    let record = LegacySession {
        logged_in: true,
        username: "ann".to_string(),
        issued_at_ms: (Utc::now() - age).timestamp_millis(),
    };
    set_json(client.storage.as_ref(), LEGACY_SESSION_KEY, &record).unwrap();
}

async fn wait_for(rx: &mut watch::Receiver<GuardState>, expected: GuardState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if *rx.borrow_and_update() == expected {
                return;
            }
            rx.changed().await.unwrap();
        }
    })
    .await
    .unwrap_or_else(|_| panic!("guard never reached {:?}", expected));
}

#[tokio::test]
async fn test_expired_legacy_session_is_rejected_and_removed() {
    let client = test_client();
    write_legacy(&client, chrono::Duration::hours(25));

    assert!(!client.facade.is_authenticated().await);
    assert!(client.storage.get(LEGACY_SESSION_KEY).unwrap().is_none());
}

#[tokio::test]
async fn test_fresh_legacy_session_bypasses_provider() {
    let client = test_client();
    write_legacy(&client, chrono::Duration::hours(1));
    client.identity.set_failing(true);

    assert!(client.facade.is_authenticated().await);
    // Without a provider session there is no identity to merge.
    assert!(client.facade.current_user_with_profile().await.is_none());
    assert_eq!(client.facade.role().await, Role::User);
}

#[tokio::test]
async fn test_wrong_password_writes_no_session() {
    let client = test_client();
    client
        .identity
        .add_account("a@x.com", "right-password", Default::default(), true);

    let outcome = client.facade.login("a@x.com", "wrong").await;
    assert!(!outcome.success);
    assert_eq!(outcome.kind, Some(AuthErrorKind::InvalidCredentials));
    assert_eq!(outcome.error.as_deref(), Some(INVALID_CREDENTIALS_MESSAGE));
    assert!(outcome.user.is_none());

    assert!(client.storage.get(LEGACY_SESSION_KEY).unwrap().is_none());
    assert!(client.storage.get(PROVIDER_SESSION_KEY).unwrap().is_none());
    assert!(!client.facade.is_authenticated().await);
}

#[tokio::test]
async fn test_logout_always_ends_authentication() {
    let client = test_client();
    register_and_login(&client, "a@x.com", Role::User).await;
    write_legacy(&client, chrono::Duration::minutes(1));
    assert!(client.facade.is_authenticated().await);

    client.facade.logout().await;
    assert!(!client.facade.is_authenticated().await);
    assert_eq!(client.identity.active_sessions(), 0);
    assert_eq!(client.records.access_token(), None);

    // Idempotent, and a dead provider does not block it.
    client.identity.set_failing(true);
    client.facade.logout().await;
    assert!(!client.facade.is_authenticated().await);
}

#[tokio::test]
async fn test_logout_clears_backends_outside_the_chain() {
    let client = test_client_with(provider_only());
    write_legacy(&client, chrono::Duration::minutes(1));

    client.facade.logout().await;
    assert!(client.storage.get(LEGACY_SESSION_KEY).unwrap().is_none());
}

#[tokio::test]
async fn test_admin_registration_grants_admin_views() {
    let client = test_client();
    assert!(register_and_login(&client, "admin@x.com", Role::Admin).await);

    let admin_view = RouteGuard::new(client.facade.clone(), RoleRequirement::AdminOnly);
    assert_eq!(admin_view.check().await, GuardState::Authorized);

    let user_view = RouteGuard::new(client.facade.clone(), RoleRequirement::UserOnly);
    assert_eq!(
        user_view.check().await,
        GuardState::Unauthorized {
            redirect: Redirect {
                to: "/admin",
                replace: true
            }
        }
    );
}

#[tokio::test]
async fn test_user_registration_denies_admin_views() {
    let client = test_client();
    assert!(!register_and_login(&client, "user@x.com", Role::User).await);

    let admin_view = RouteGuard::new(client.facade.clone(), RoleRequirement::AdminOnly);
    assert_eq!(
        admin_view.check().await,
        GuardState::Unauthorized {
            redirect: Redirect {
                to: "/dashboard",
                replace: true
            }
        }
    );
    let user_view = RouteGuard::new(client.facade.clone(), RoleRequirement::UserOnly);
    assert_eq!(user_view.check().await, GuardState::Authorized);
}

#[tokio::test]
async fn test_guard_redirects_to_login_when_signed_out() {
    let client = test_client();
    for requirement in [
        RoleRequirement::Any,
        RoleRequirement::AdminOnly,
        RoleRequirement::UserOnly,
    ] {
        let guard = RouteGuard::new(client.facade.clone(), requirement);
        assert_eq!(
            guard.check().await,
            GuardState::Unauthorized {
                redirect: Redirect {
                    to: "/login",
                    replace: true
                }
            }
        );
    }
}

#[tokio::test]
async fn test_guard_watcher_recomputes_on_sign_out() {
    let client = test_client();
    register_and_login(&client, "admin@x.com", Role::Admin).await;

    let watcher = GuardWatcher::spawn(RouteGuard::new(
        client.facade.clone(),
        RoleRequirement::AdminOnly,
    ));
    let mut rx = watcher.receiver();
    wait_for(&mut rx, GuardState::Authorized).await;

    client.facade.logout().await;
    wait_for(
        &mut rx,
        GuardState::Unauthorized {
            redirect: Redirect {
                to: "/login",
                replace: true,
            },
        },
    )
    .await;
    assert!(matches!(watcher.state(), GuardState::Unauthorized { .. }));
}

#[tokio::test]
async fn test_concurrent_post_updates_last_write_wins() {
    let client = test_client();
    let posts = PostRepository::new(client.records.clone());
    let post = posts
        .create(&NewPost {
            user_id: "u1".to_string(),
            title: "Original".to_string(),
            slug: "original".to_string(),
            excerpt: None,
            content: "body".to_string(),
            category: None,
            published: true,
        })
        .await
        .unwrap();

    let first = PostPatch {
        title: Some("First".to_string()),
        ..Default::default()
    };
    let second = PostPatch {
        title: Some("Second".to_string()),
        ..Default::default()
    };
    let (a, b) = tokio::join!(posts.update(&post.id, &first), posts.update(&post.id, &second));
    let (a, b) = (a.unwrap(), b.unwrap());

    let last = if a.updated_at > b.updated_at { a } else { b };
    let stored = posts.get_by_slug("original").await.unwrap().unwrap();
    assert_eq!(stored.title, last.title);
}

#[tokio::test]
async fn test_expired_provider_session_refreshes_once() {
    let client = test_client_with(provider_only());
    client
        .identity
        .add_account("a@x.com", "secret1", Default::default(), true);
    client.identity.set_session_ttl(-10);
    assert!(client.facade.login("a@x.com", "secret1").await.success);
    client.identity.set_session_ttl(3600);

    let mut events = client.facade.subscribe();
    assert!(client.facade.is_authenticated().await);
    assert!(client.facade.is_authenticated().await);
    assert_eq!(client.identity.refresh_calls(), 1);
    assert_eq!(events.recv().await.unwrap(), AuthEvent::TokenRefreshed);
}

#[tokio::test]
async fn test_refresh_fails_closed_after_revocation() {
    let client = test_client_with(provider_only());
    client
        .identity
        .add_account("a@x.com", "secret1", Default::default(), true);
    client.identity.set_session_ttl(-10);
    assert!(client.facade.login("a@x.com", "secret1").await.success);

    client.identity.revoke_all();
    assert!(!client.facade.is_authenticated().await);
    assert!(client.storage.get(PROVIDER_SESSION_KEY).unwrap().is_none());
    assert!(!client.facade.is_authenticated().await);
    assert_eq!(client.identity.refresh_calls(), 1);
}

#[tokio::test]
async fn test_rate_limit_is_reported() {
    let client = test_client();
    client.identity.set_rate_limited(true);

    let outcome = client.facade.login("a@x.com", "whatever").await;
    assert_eq!(outcome.kind, Some(AuthErrorKind::RateLimited));
    assert_eq!(outcome.error.as_deref(), Some(RATE_LIMITED_MESSAGE));

    let reset = client.facade.reset_password("a@x.com").await;
    assert!(!reset.success);
    assert_eq!(reset.kind, Some(AuthErrorKind::RateLimited));
}

#[tokio::test]
async fn test_provider_outage_is_transient() {
    let client = test_client();
    client.identity.set_failing(true);

    let outcome = client.facade.login("a@x.com", "secret1").await;
    assert_eq!(outcome.kind, Some(AuthErrorKind::Transient));
    assert_eq!(outcome.error.as_deref(), Some(TRANSIENT_MESSAGE));

    let registered = client
        .facade
        .register("a@x.com", "secret1", "Ann", "ann", Role::User)
        .await;
    assert!(!registered.success);
    assert_eq!(registered.error.as_deref(), Some(TRANSIENT_MESSAGE));
}

#[tokio::test]
async fn test_duplicate_registration() {
    let client = test_client();
    client
        .facade
        .register("a@x.com", "secret1", "Ann", "ann", Role::User)
        .await;
    let again = client
        .facade
        .register("A@x.com", "secret2", "Ann", "ann2", Role::User)
        .await;
    assert!(!again.success);
    assert_eq!(again.kind, Some(AuthErrorKind::DuplicateIdentity));
    assert_eq!(again.error.as_deref(), Some(DUPLICATE_MESSAGE));
}

#[tokio::test]
async fn test_unconfirmed_registration() {
    let client = test_client();
    client.identity.set_require_confirmation(true);

    let registered = client
        .facade
        .register("a@x.com", "secret1", "Ann", "ann", Role::User)
        .await;
    assert!(registered.success);
    assert!(registered.confirmation_pending);
    assert!(registered.message.unwrap().contains("confirm your account"));
    assert!(!client.facade.is_authenticated().await);

    let outcome = client.facade.login("a@x.com", "secret1").await;
    assert_eq!(outcome.kind, Some(AuthErrorKind::UnconfirmedIdentity));
    assert_eq!(outcome.error.as_deref(), Some(UNCONFIRMED_MESSAGE));

    client.identity.confirm("a@x.com");
    assert!(client.facade.login("a@x.com", "secret1").await.success);
}

#[tokio::test]
async fn test_profile_failure_does_not_block_registration() {
    let client = test_client();
    client.records.set_failing(true);

    let registered = client
        .facade
        .register("a@x.com", "secret1", "Ann", "ann", Role::Admin)
        .await;
    assert!(registered.success);
    assert!(registered.profile_pending);
    assert!(registered.message.unwrap().contains("profile is pending"));
    assert_eq!(client.facade.journal().pending().unwrap().len(), 1);

    client.records.set_failing(false);
    let reconciler = ProfileReconciler::new(
        ProfileRepository::new(client.records.clone()),
        client.facade.journal().clone(),
    );
    let report = reconciler.run_once().await.unwrap();
    assert_eq!(
        report,
        ReconcileReport {
            created: 1,
            already_present: 0,
            failed: 0
        }
    );
    assert!(client.facade.journal().pending().unwrap().is_empty());
    assert_eq!(client.facade.role().await, Role::Admin);
}

#[tokio::test]
async fn test_login_drains_journaled_profile() {
    let client = test_client();
    let user = client
        .identity
        .add_account("a@x.com", "secret1", Default::default(), true);
    client
        .facade
        .journal()
        .record(&NewProfile {
            id: user.id.clone(),
            email: user.email.clone(),
            name: "Ann".to_string(),
            username: "annie".to_string(),
            role: Role::Admin,
        })
        .unwrap();

    let outcome = client.facade.login("a@x.com", "secret1").await;
    assert_eq!(outcome.is_admin, Some(true));
    assert!(client.facade.journal().pending().unwrap().is_empty());

    let legacy: LegacySession = get_json(client.storage.as_ref(), LEGACY_SESSION_KEY)
        .unwrap()
        .unwrap();
    assert_eq!(legacy.username, "annie");
}

#[tokio::test]
async fn test_login_creates_missing_profile_from_metadata() {
    let client = test_client();
    let user = client.identity.add_account(
        "a@x.com",
        "secret1",
        site_common::UserMetadata {
            name: "Ann".to_string(),
            username: "ann".to_string(),
            role: Some(Role::Admin),
        },
        true,
    );

    let outcome = client.facade.login("a@x.com", "secret1").await;
    assert_eq!(outcome.is_admin, Some(true));
    let rows = client.records.rows(Table::Users);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["id"], user.id.as_str());
}

#[tokio::test]
async fn test_profile_outage_defaults_role_to_user() {
    let client = test_client();
    client.identity.add_account(
        "a@x.com",
        "secret1",
        site_common::UserMetadata {
            role: Some(Role::Admin),
            ..Default::default()
        },
        true,
    );
    client.records.set_failing(true);

    let outcome = client.facade.login("a@x.com", "secret1").await;
    assert!(outcome.success);
    assert_eq!(outcome.is_admin, Some(false));

    let current = client.facade.current_user_with_profile().await.unwrap();
    assert!(current.profile.is_none());
    assert_eq!(current.role(), Role::User);
}

#[tokio::test]
async fn test_current_user_merges_profile() {
    let client = test_client();
    register_and_login(&client, "a@x.com", Role::User).await;

    let current = client.facade.current_user_with_profile().await.unwrap();
    assert_eq!(current.user.email, "a@x.com");
    let profile = current.profile.unwrap();
    assert_eq!(profile.id, current.user.id);
    assert_eq!(profile.username, "ann");
}

#[tokio::test]
async fn test_revoked_session_clears_current_user() {
    let client = test_client_with(provider_only());
    register_and_login(&client, "a@x.com", Role::User).await;

    client.identity.revoke_all();
    assert!(client.facade.current_user_with_profile().await.is_none());
    assert!(client.storage.get(PROVIDER_SESSION_KEY).unwrap().is_none());
    assert!(!client.facade.is_authenticated().await);
}

#[tokio::test]
async fn test_reset_password_does_not_reveal_accounts() {
    let client = test_client();
    let reset = client.facade.reset_password("nobody@x.com").await;
    assert!(reset.success);
    assert!(reset.error.is_none());
    assert_eq!(client.identity.reset_requests(), vec!["nobody@x.com"]);
}

#[tokio::test]
async fn test_auth_events_are_published() {
    let client = test_client();
    let mut events = client.facade.subscribe();
    client
        .identity
        .add_account("a@x.com", "secret1", Default::default(), true);

    client.facade.login("a@x.com", "secret1").await;
    client.facade.logout().await;

    assert!(matches!(events.recv().await.unwrap(), AuthEvent::SignedIn { .. }));
    assert_eq!(events.recv().await.unwrap(), AuthEvent::SignedOut);
}

/// Memory storage that refuses to write one key.
struct RefusingStorage {
    inner: MemoryStorage,
    refused: &'static str,
}

impl LocalStorage for RefusingStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        if key == self.refused {
            return Err(StorageError::Io(std::io::Error::other("disk full")));
        }
        self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.inner.remove(key)
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        self.inner.keys()
    }
}

#[tokio::test]
async fn test_failed_session_write_leaves_no_session() {
    let identity = Arc::new(FakeIdentity::new());
    let records = Arc::new(FakeRecordStore::new());
    let storage = Arc::new(RefusingStorage {
        inner: MemoryStorage::new(),
        refused: PROVIDER_SESSION_KEY,
    });
    let facade = AuthFacade::new(
        identity.clone(),
        records.clone(),
        storage.clone(),
        &Config::default(),
    )
    .unwrap();
    identity.add_account("a@x.com", "secret1", Default::default(), true);

    let outcome = facade.login("a@x.com", "secret1").await;

    assert!(!outcome.success);
    assert_eq!(outcome.kind, Some(AuthErrorKind::Transient));
    assert!(!facade.is_authenticated().await);
    assert!(storage.get(LEGACY_SESSION_KEY).unwrap().is_none());
    assert_eq!(identity.active_sessions(), 0);
    assert_eq!(records.access_token(), None);
}
