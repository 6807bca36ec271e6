use std::sync::Arc;

use chrono::{Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};

use crate::auth::AuthUser;
use crate::config::{AuthConfig, Config, CorsConfig, DatabaseConfig, LoggingConfig, ServerConfig};
use crate::identity::tokens::AccessClaims;
use crate::AppState;

pub const TEST_JWT_SECRET: &str = "test-secret";

/// In-memory database, no email confirmation, cheap password hashing.
pub fn test_config() -> Config {
    let mut auth = AuthConfig::with_secret(TEST_JWT_SECRET);
    auth.require_email_confirmation = false;
    auth.password_hash_memory_kib = 64;
    auth.password_hash_iterations = 1;

    Config {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        database: DatabaseConfig {
            url: "sqlite::memory:".to_string(),
        },
        auth,
        logging: LoggingConfig {
            level: "debug".to_string(),
        },
        cors: CorsConfig {
            origins: "*".to_string(),
        },
    }
}

pub fn create_test_state() -> AppState {
    create_test_state_with(|_| {})
}

pub fn create_test_state_with(configure: impl FnOnce(&mut Config)) -> AppState {
    let mut config = test_config();
    configure(&mut config);
    AppState::new(config).expect("Failed to create test state")
}

pub fn create_test_app() -> (Arc<AppState>, axum::Router) {
    let state = Arc::new(create_test_state());
    (state.clone(), crate::app(state))
}

/// Sign an access token directly, bypassing the session table.
pub fn generate_test_jwt(user_id: &str, email: &str, session_id: &str, ttl: Duration) -> String {
    let now = Utc::now();
    let claims = AccessClaims {
        sub: user_id.to_string(),
        email: email.to_string(),
        sid: session_id.to_string(),
        iat: now.timestamp(),
        exp: (now + ttl).timestamp(),
    };

    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(TEST_JWT_SECRET.as_bytes()),
    )
    .expect("Failed to encode JWT")
}

pub fn test_auth_user(id: &str) -> AuthUser {
    AuthUser {
        id: id.to_string(),
        email: format!("{}@example.com", id),
        session_id: format!("session-{}", id),
    }
}
