//! Identity provider routes (`/auth/v1/*`).

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::Value;

use site_common::{
    IdentityUser, PasswordGrant, RecoverRequest, RefreshGrant, Session, SignUpRequest,
    SignUpResponse, VerifyRequest,
};

use crate::error::{ApiError, Result};
use crate::AppState;

#[derive(Debug, Deserialize)]
struct TokenParams {
    grant_type: String,
}

fn parse_body<T: serde::de::DeserializeOwned>(body: Value) -> Result<T> {
    serde_json::from_value(body).map_err(|e| ApiError::Validation(e.to_string()))
}

/// Run an identity call that hashes or verifies a password on the blocking pool.
async fn blocking<T, F>(call: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|e| ApiError::Internal(format!("password task failed: {}", e)))?
}

/// POST /auth/v1/signup
async fn signup(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SignUpRequest>,
) -> Result<Json<SignUpResponse>> {
    blocking(move || state.identity.sign_up(request)).await.map(Json)
}

/// POST /auth/v1/token?grant_type=password|refresh_token
async fn token(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TokenParams>,
    Json(body): Json<Value>,
) -> Result<Json<Session>> {
    let session = match params.grant_type.as_str() {
        "password" => {
            let grant = parse_body::<PasswordGrant>(body)?;
            blocking(move || state.identity.sign_in(grant)).await?
        }
        "refresh_token" => state.identity.refresh(parse_body::<RefreshGrant>(body)?)?,
        other => {
            return Err(ApiError::Validation(format!(
                "Unsupported grant_type: {}",
                other
            )))
        }
    };
    Ok(Json(session))
}

/// POST /auth/v1/logout
async fn logout(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Result<StatusCode> {
    let user = state.identity.authenticate(&headers)?;
    state.identity.sign_out(&user)?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /auth/v1/user
async fn user(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Result<Json<IdentityUser>> {
    let user = state.identity.authenticate(&headers)?;
    state.identity.get_user(&user).map(Json)
}

/// POST /auth/v1/recover
async fn recover(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RecoverRequest>,
) -> Result<Json<Value>> {
    state.identity.recover(request)?;
    Ok(Json(serde_json::json!({})))
}

/// POST /auth/v1/verify
async fn verify(
    State(state): State<Arc<AppState>>,
    Json(request): Json<VerifyRequest>,
) -> Result<Json<Session>> {
    blocking(move || state.identity.verify(request)).await.map(Json)
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/signup", post(signup))
        .route("/token", post(token))
        .route("/logout", post(logout))
        .route("/user", get(user))
        .route("/recover", post(recover))
        .route("/verify", post(verify))
        .with_state(state)
}
