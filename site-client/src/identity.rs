//! Identity provider client.
//!
//! [`IdentityProvider`] is the black-box surface the auth facade depends on.
//! [`HostedIdentity`] speaks the `/auth/v1/*` HTTP API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::{de::DeserializeOwned, Serialize};

use site_common::{
    ErrorBody, IdentityUser, PasswordGrant, RecoverRequest, RefreshGrant, Session,
    SignUpRequest, SignUpResponse,
};

use crate::error::IdentityError;

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn sign_up(&self, request: &SignUpRequest) -> Result<SignUpResponse, IdentityError>;

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, IdentityError>;

    /// Revoke the session behind `access_token`.
    async fn sign_out(&self, access_token: &str) -> Result<(), IdentityError>;

    /// The live identity behind `access_token` (the provider's get-session).
    async fn get_user(&self, access_token: &str) -> Result<IdentityUser, IdentityError>;

    async fn refresh_session(&self, refresh_token: &str) -> Result<Session, IdentityError>;

    async fn reset_password_for_email(&self, email: &str) -> Result<(), IdentityError>;
}

/// Decode an error body, falling back to the raw text.
pub(crate) async fn error_from_response(response: Response) -> (u16, Option<String>, String) {
    let status = response.status().as_u16();
    let text = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => (status, Some(body.error), body.message),
        Err(_) if text.is_empty() => (status, None, format!("HTTP {}", status)),
        Err(_) => (status, None, text),
    }
}

/// HTTP client for a hosted identity provider.
pub struct HostedIdentity {
    http_client: Client,
    base_url: String,
}

impl HostedIdentity {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, IdentityError> {
        let http_client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/auth/v1{}", self.base_url, path)
    }

    async fn check(response: Response) -> Result<Response, IdentityError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let (status, code, message) = error_from_response(response).await;
        tracing::debug!(status, ?code, "Identity provider error: {}", message);
        Err(IdentityError::Provider {
            status,
            code,
            message,
        })
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, IdentityError> {
        let response = self.http_client.post(self.url(path)).json(body).send().await?;
        let response = Self::check(response).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| IdentityError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl IdentityProvider for HostedIdentity {
    async fn sign_up(&self, request: &SignUpRequest) -> Result<SignUpResponse, IdentityError> {
        self.post_json("/signup", request).await
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, IdentityError> {
        let grant = PasswordGrant {
            email: email.to_string(),
            password: password.to_string(),
        };
        self.post_json("/token?grant_type=password", &grant).await
    }

    async fn sign_out(&self, access_token: &str) -> Result<(), IdentityError> {
        let response = self
            .http_client
            .post(self.url("/logout"))
            .bearer_auth(access_token)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn get_user(&self, access_token: &str) -> Result<IdentityUser, IdentityError> {
        let response = self
            .http_client
            .get(self.url("/user"))
            .bearer_auth(access_token)
            .send()
            .await?;
        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| IdentityError::InvalidResponse(e.to_string()))
    }

    async fn refresh_session(&self, refresh_token: &str) -> Result<Session, IdentityError> {
        let grant = RefreshGrant {
            refresh_token: refresh_token.to_string(),
        };
        self.post_json("/token?grant_type=refresh_token", &grant).await
    }

    async fn reset_password_for_email(&self, email: &str) -> Result<(), IdentityError> {
        let request = RecoverRequest {
            email: email.to_string(),
        };
        let _: serde_json::Value = self.post_json("/recover", &request).await?;
        Ok(())
    }
}
