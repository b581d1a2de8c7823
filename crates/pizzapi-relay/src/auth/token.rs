//! Org-scoped signed tokens, verified against the control plane's JWKS.
//!
//! Multi-tenant deployments let runners (and HTTP callers) authenticate with
//! a token minted by the control plane instead of an API key. The token must
//! verify against the JWKS, carry the expected `type`, and be scoped to this
//! relay's org.

use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use log::debug;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use super::error::AuthError;
use super::provider::AuthIdentity;

const JWKS_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
const JWKS_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Deserialize)]
struct Jwks {
    keys: Vec<Jwk>,
}

#[derive(Debug, Clone, Deserialize)]
struct Jwk {
    #[serde(default)]
    kid: Option<String>,
    kty: String,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
}

/// Claims carried by control-plane tokens.
#[derive(Debug, Clone, Deserialize)]
pub struct OrgTokenClaims {
    pub sub: String,
    pub exp: i64,
    /// Token purpose: "runner" for runner daemons, "session" for HTTP
    /// session-context tokens.
    #[serde(rename = "type")]
    pub token_type: String,
    pub org_id: String,
    #[serde(default)]
    pub org_slug: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// JWKS fetcher with a 5 minute cache.
pub struct JwksCache {
    url: String,
    client: reqwest::Client,
    cached: RwLock<Option<(Instant, Jwks)>>,
}

impl JwksCache {
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(JWKS_FETCH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            url: url.into(),
            client,
            cached: RwLock::new(None),
        }
    }

    async fn get(&self) -> Result<Jwks, AuthError> {
        if let Some((fetched_at, jwks)) = self.cached.read().await.as_ref() {
            if fetched_at.elapsed() < JWKS_CACHE_TTL {
                return Ok(jwks.clone());
            }
        }

        let jwks: Jwks = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|err| AuthError::Provider(format!("fetching JWKS: {err}")))?
            .json()
            .await
            .map_err(|err| AuthError::Provider(format!("parsing JWKS: {err}")))?;

        *self.cached.write().await = Some((Instant::now(), jwks.clone()));
        Ok(jwks)
    }

    fn find_key<'a>(jwks: &'a Jwks, kid: Option<&str>) -> Option<&'a Jwk> {
        match kid {
            Some(kid) => jwks
                .keys
                .iter()
                .find(|key| key.kid.as_deref() == Some(kid)),
            None => jwks.keys.first(),
        }
    }
}

/// Validates control-plane tokens for one org.
pub struct OrgTokenValidator {
    jwks: JwksCache,
    org_id: String,
    org_slug: String,
}

impl OrgTokenValidator {
    pub fn new(jwks_url: &str, org_id: &str, org_slug: &str) -> Self {
        Self {
            jwks: JwksCache::new(jwks_url),
            org_id: org_id.to_string(),
            org_slug: org_slug.to_string(),
        }
    }

    pub fn org_slug(&self) -> &str {
        &self.org_slug
    }

    /// Verify signature, expiry, `type` and `org_id`.
    pub async fn validate(
        &self,
        token: &str,
        expected_type: &str,
    ) -> Result<OrgTokenClaims, AuthError> {
        let header = decode_header(token)
            .map_err(|err| AuthError::InvalidToken(err.to_string()))?;

        let jwks = self.jwks.get().await?;
        let key = JwksCache::find_key(&jwks, header.kid.as_deref())
            .filter(|key| key.kty == "RSA")
            .ok_or_else(|| AuthError::InvalidToken("no matching JWKS key".into()))?;

        let (n, e) = match (&key.n, &key.e) {
            (Some(n), Some(e)) => (n.as_str(), e.as_str()),
            _ => return Err(AuthError::InvalidToken("incomplete JWKS key".into())),
        };
        let decoding_key = DecodingKey::from_rsa_components(n, e)
            .map_err(|err| AuthError::InvalidToken(err.to_string()))?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = true;
        validation.required_spec_claims.clear();

        let data = decode::<OrgTokenClaims>(token, &decoding_key, &validation).map_err(|err| {
            debug!("org token validation failed: {err}");
            AuthError::InvalidToken(err.to_string())
        })?;

        let claims = data.claims;
        if claims.token_type != expected_type {
            return Err(AuthError::InvalidToken(format!(
                "expected a {expected_type} token"
            )));
        }
        if claims.org_id != self.org_id {
            return Err(AuthError::WrongOrg);
        }
        Ok(claims)
    }

    /// Validate a runner token and resolve it to an identity.
    pub async fn validate_runner_token(&self, token: &str) -> Result<AuthIdentity, AuthError> {
        let claims = self.validate(token, "runner").await?;
        Ok(AuthIdentity {
            user_name: claims.name.clone().unwrap_or_else(|| claims.sub.clone()),
            user_id: claims.sub,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_key_prefers_matching_kid() {
        let jwks = Jwks {
            keys: vec![
                Jwk {
                    kid: Some("a".into()),
                    kty: "RSA".into(),
                    n: Some("na".into()),
                    e: Some("AQAB".into()),
                },
                Jwk {
                    kid: Some("b".into()),
                    kty: "RSA".into(),
                    n: Some("nb".into()),
                    e: Some("AQAB".into()),
                },
            ],
        };

        let key = JwksCache::find_key(&jwks, Some("b")).unwrap();
        assert_eq!(key.n.as_deref(), Some("nb"));

        // No kid in the token header: fall back to the first key.
        let key = JwksCache::find_key(&jwks, None).unwrap();
        assert_eq!(key.kid.as_deref(), Some("a"));

        assert!(JwksCache::find_key(&jwks, Some("missing")).is_none());
    }

    #[test]
    fn org_claims_parse_type_field() {
        let claims: OrgTokenClaims = serde_json::from_str(
            r#"{"sub":"u-1","exp":4102444800,"type":"runner","org_id":"org-1"}"#,
        )
        .unwrap();
        assert_eq!(claims.token_type, "runner");
        assert_eq!(claims.org_id, "org-1");
        assert!(claims.role.is_none());
    }
}
