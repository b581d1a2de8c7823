//! Per-namespace handshake validation.
//!
//! Three shapes, one per client class: API key (runners, producer TUIs),
//! session cookie with an Origin check (viewers, terminals, hub), and the
//! runner dual path (API key or an org-scoped signed token). All of them
//! resolve to the same [`AuthIdentity`].

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{HeaderMap, StatusCode, header, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};
use log::{debug, warn};
use std::sync::Arc;

use super::error::AuthError;
use super::provider::{AuthIdentity, AuthProvider};
use super::token::OrgTokenValidator;

/// Extract a Bearer token from an Authorization header value.
fn bearer_token_from_header(header_value: &str) -> Option<&str> {
    let mut parts = header_value.split_whitespace();
    let scheme = parts.next()?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = parts.next().filter(|t| !t.is_empty())?;
    if parts.next().is_some() {
        return None;
    }
    Some(token)
}

fn cookie_from_header<'a>(cookie_header: &'a str, cookie_name: &str) -> Option<&'a str> {
    cookie_header.split(';').map(str::trim).find_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        (name.trim() == cookie_name).then(|| value.trim())
    })
}

/// Pull a named value out of a raw query string (browsers cannot set
/// headers on WebSocket upgrades, so credentials ride the query).
fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    query?.split('&').find_map(|pair| {
        let mut parts = pair.splitn(2, '=');
        let key = parts.next()?;
        let value = parts.next()?;
        if key == name {
            urlencoding::decode(value).ok().map(|v| v.into_owned())
        } else {
            None
        }
    })
}

/// Session-context identity for multi-tenant HTTP requests. Travels in the
/// request extensions; the request itself is never mutated.
#[derive(Debug, Clone)]
pub struct OrgContext {
    pub user_id: String,
    pub org_id: String,
    pub org_slug: String,
    pub role: String,
}

impl<S> FromRequestParts<S> for OrgContext
where
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<OrgContext>()
            .cloned()
            .ok_or(StatusCode::UNAUTHORIZED)
    }
}

/// Handshake validator shared by every namespace and the HTTP surface.
pub struct AuthGate {
    provider: Arc<dyn AuthProvider>,
    org_tokens: Option<Arc<OrgTokenValidator>>,
    trusted_origins: Vec<String>,
    session_cookie: String,
}

impl AuthGate {
    pub fn new(
        provider: Arc<dyn AuthProvider>,
        org_tokens: Option<Arc<OrgTokenValidator>>,
        trusted_origins: Vec<String>,
        session_cookie: String,
    ) -> Self {
        if trusted_origins.is_empty() {
            warn!("no trusted origins configured; Origin checks are disabled");
        }
        Self {
            provider,
            org_tokens,
            trusted_origins,
            session_cookie,
        }
    }

    pub fn is_multi_tenant(&self) -> bool {
        self.org_tokens.is_some()
    }

    /// Reject handshakes whose Origin is present but not trusted. Runs
    /// before any cookie is inspected.
    pub fn check_origin(&self, headers: &HeaderMap) -> Result<(), AuthError> {
        let Some(origin) = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) else {
            return Ok(());
        };
        if self.trusted_origins.is_empty() {
            return Ok(());
        }
        if self.trusted_origins.iter().any(|trusted| trusted == origin) {
            Ok(())
        } else {
            Err(AuthError::UntrustedOrigin(origin.to_string()))
        }
    }

    /// API-key handshake: `x-api-key` header or `apiKey` query param.
    pub async fn authenticate_api_key(
        &self,
        headers: &HeaderMap,
        query: Option<&str>,
    ) -> Result<AuthIdentity, AuthError> {
        let api_key = headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| query_param(query, "apiKey"))
            .ok_or(AuthError::MissingCredentials)?;

        self.provider.resolve_api_key(&api_key).await
    }

    /// Cookie handshake for browser namespaces: Origin check, then the
    /// session cookie resolved through the auth provider.
    pub async fn authenticate_viewer(&self, headers: &HeaderMap) -> Result<AuthIdentity, AuthError> {
        self.check_origin(headers)?;

        let cookie_header = headers
            .get(header::COOKIE)
            .and_then(|v| v.to_str().ok())
            .ok_or(AuthError::MissingCredentials)?;
        if cookie_from_header(cookie_header, &self.session_cookie).is_none() {
            return Err(AuthError::MissingCredentials);
        }

        self.provider.resolve_session_cookie(cookie_header).await
    }

    /// Runner handshake: API key, or (multi-tenant only) an org-scoped
    /// signed token from `?token=` or the Authorization header. Never falls
    /// through to anonymous access.
    pub async fn authenticate_runner(
        &self,
        headers: &HeaderMap,
        query: Option<&str>,
    ) -> Result<AuthIdentity, AuthError> {
        match self.authenticate_api_key(headers, query).await {
            Ok(identity) => return Ok(identity),
            Err(AuthError::MissingCredentials) => {}
            Err(err) => return Err(err),
        }

        let Some(validator) = &self.org_tokens else {
            return Err(AuthError::MissingCredentials);
        };

        let token = query_param(query, "token")
            .or_else(|| {
                headers
                    .get(header::AUTHORIZATION)
                    .and_then(|v| v.to_str().ok())
                    .and_then(bearer_token_from_header)
                    .map(str::to_string)
            })
            .ok_or(AuthError::MissingCredentials)?;

        validator.validate_runner_token(&token).await
    }

    /// Session-context token for multi-tenant HTTP requests:
    /// `Authorization: Bearer …` or an `org_token` cookie.
    pub async fn authenticate_org_request(
        &self,
        headers: &HeaderMap,
    ) -> Result<OrgContext, AuthError> {
        let validator = self
            .org_tokens
            .as_ref()
            .ok_or(AuthError::MissingCredentials)?;

        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(bearer_token_from_header)
            .map(str::to_string)
            .or_else(|| {
                headers
                    .get(header::COOKIE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|cookies| cookie_from_header(cookies, "org_token"))
                    .map(str::to_string)
            })
            .ok_or(AuthError::MissingCredentials)?;

        let claims = validator.validate(&token, "session").await?;
        Ok(OrgContext {
            user_id: claims.sub,
            org_id: claims.org_id,
            org_slug: claims
                .org_slug
                .unwrap_or_else(|| validator.org_slug().to_string()),
            role: claims.role.unwrap_or_else(|| "member".to_string()),
        })
    }
}

/// Multi-tenant HTTP gate: validates the session-context token and stores
/// the resulting [`OrgContext`] in the request extensions.
pub async fn org_middleware(
    State(gate): State<Arc<AuthGate>>,
    mut req: Request,
    next: Next,
) -> Response {
    match gate.authenticate_org_request(req.headers()).await {
        Ok(ctx) => {
            req.extensions_mut().insert(ctx);
            next.run(req).await
        }
        Err(err) => {
            debug!("org gate rejected request: {err}");
            StatusCode::UNAUTHORIZED.into_response()
        }
    }
}
