//! Auth provider abstraction.
//!
//! API keys and browser session cookies are minted elsewhere (the platform's
//! auth service); the relay only resolves them to an identity. The provider
//! is constructor-injected so namespaces and tests never reach for globals.

use async_trait::async_trait;
use log::debug;
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use super::error::AuthError;

/// The identity every successful handshake resolves to.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthIdentity {
    pub user_id: String,
    pub user_name: String,
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn resolve_api_key(&self, api_key: &str) -> Result<AuthIdentity, AuthError>;

    async fn resolve_session_cookie(&self, cookie: &str) -> Result<AuthIdentity, AuthError>;
}

// ============================================================================
// HTTP provider
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityResponse {
    user_id: String,
    #[serde(default)]
    user_name: String,
}

/// Resolves credentials against the platform auth service.
pub struct HttpAuthProvider {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAuthProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    async fn resolve(&self, request: reqwest::RequestBuilder) -> Result<AuthIdentity, AuthError> {
        // Any provider failure, network included, reads as a bad handshake.
        let response = request.send().await.map_err(|err| {
            debug!("auth provider unreachable: {err}");
            AuthError::Provider(err.to_string())
        })?;

        if response.status() == StatusCode::OK {
            let identity: IdentityResponse = response
                .json()
                .await
                .map_err(|err| AuthError::Provider(err.to_string()))?;
            Ok(AuthIdentity {
                user_id: identity.user_id,
                user_name: identity.user_name,
            })
        } else {
            Err(AuthError::Unauthorized)
        }
    }
}

#[async_trait]
impl AuthProvider for HttpAuthProvider {
    async fn resolve_api_key(&self, api_key: &str) -> Result<AuthIdentity, AuthError> {
        let url = format!("{}/api/auth/verify-key", self.base_url);
        self.resolve(self.client.get(&url).header("x-api-key", api_key))
            .await
    }

    async fn resolve_session_cookie(&self, cookie: &str) -> Result<AuthIdentity, AuthError> {
        let url = format!("{}/api/auth/get-session", self.base_url);
        self.resolve(
            self.client
                .get(&url)
                .header(reqwest::header::COOKIE, cookie),
        )
        .await
    }
}

// ============================================================================
// Static provider
// ============================================================================

/// Fixed credential table for tests, plus the single-user mode used when no
/// auth service is configured.
#[derive(Default)]
pub struct StaticAuthProvider {
    api_keys: HashMap<String, AuthIdentity>,
    cookies: HashMap<String, AuthIdentity>,
    accept_all: Option<AuthIdentity>,
}

impl StaticAuthProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Self-hosted single-user mode: every credential resolves to the local
    /// user.
    pub fn single_user() -> Self {
        Self {
            accept_all: Some(AuthIdentity {
                user_id: "local".into(),
                user_name: "Local User".into(),
            }),
            ..Self::default()
        }
    }

    pub fn with_api_key(mut self, key: &str, identity: AuthIdentity) -> Self {
        self.api_keys.insert(key.to_string(), identity);
        self
    }

    pub fn with_cookie(mut self, value: &str, identity: AuthIdentity) -> Self {
        self.cookies.insert(value.to_string(), identity);
        self
    }
}

#[async_trait]
impl AuthProvider for StaticAuthProvider {
    async fn resolve_api_key(&self, api_key: &str) -> Result<AuthIdentity, AuthError> {
        if let Some(identity) = self.api_keys.get(api_key) {
            return Ok(identity.clone());
        }
        self.accept_all.clone().ok_or(AuthError::Unauthorized)
    }

    async fn resolve_session_cookie(&self, cookie: &str) -> Result<AuthIdentity, AuthError> {
        if let Some(identity) = self.cookies.get(cookie) {
            return Ok(identity.clone());
        }
        self.accept_all.clone().ok_or(AuthError::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ada() -> AuthIdentity {
        AuthIdentity {
            user_id: "u-1".into(),
            user_name: "Ada".into(),
        }
    }

    #[tokio::test]
    async fn static_provider_rejects_unknown_keys() {
        let provider = StaticAuthProvider::new().with_api_key("good", ada());
        assert_eq!(provider.resolve_api_key("good").await.unwrap(), ada());
        assert!(provider.resolve_api_key("bad").await.is_err());
        assert!(provider.resolve_session_cookie("any").await.is_err());
    }

    #[tokio::test]
    async fn single_user_mode_accepts_everything() {
        let provider = StaticAuthProvider::single_user();
        assert_eq!(
            provider.resolve_api_key("whatever").await.unwrap().user_id,
            "local"
        );
    }
}
