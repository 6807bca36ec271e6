pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod identity;
pub mod logging;
pub mod records;
pub mod routes;
pub mod test_util;

pub use auth::{AuthError, AuthUser};
pub use config::Config;
pub use db::Database;
pub use error::ApiError;
pub use identity::IdentityService;
pub use records::RecordService;

use std::sync::Arc;

use axum::{http::HeaderValue, middleware, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub db: Arc<Database>,
    pub identity: IdentityService,
    pub records: RecordService,
}

impl AppState {
    /// Open the database and wire the identity provider and record store to it.
    pub fn new(config: Config) -> Result<Self, ApiError> {
        let db = Arc::new(Database::open(&config.database.url)?);
        let hasher = identity::PasswordHasher::new(
            config.auth.password_hash_memory_kib,
            config.auth.password_hash_iterations,
        )?;

        if config.auth.allow_unconfirmed_login {
            tracing::warn!("auth.allow_unconfirmed_login is enabled; unconfirmed emails can sign in");
        }

        Ok(Self {
            identity: IdentityService::new(db.clone(), config.auth.clone(), hasher),
            records: RecordService::new(db.clone()),
            db,
            config,
        })
    }
}

fn cors_layer(origins: &str) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.trim() == "*" {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = origins
        .split(',')
        .filter_map(|origin| origin.trim().parse().ok())
        .collect();
    layer.allow_origin(origins)
}

/// Build the full HTTP surface.
pub fn app(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config.cors.origins);

    Router::new()
        .merge(routes::health::router(state.clone()))
        .nest("/auth/v1", routes::auth::router(state.clone()))
        .nest("/rest/v1", routes::rest::router(state.clone()))
        .nest("/realtime/v1", routes::realtime::router(state))
        .layer(middleware::from_fn(logging::request_logger))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
