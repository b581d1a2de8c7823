//! Push delivery providers.
//!
//! The notifier fans out through a [`PushProvider`] so tests and deployments
//! without VAPID keys never touch the network. The web-push implementation
//! authenticates to the subscription endpoint with a VAPID ES256 token.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use log::debug;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::settings::VapidSettings;

/// Seconds a pushed notification may be queued by the push service.
const PUSH_TTL_SECS: u32 = 60;
/// VAPID token lifetime.
const VAPID_EXP_SECS: i64 = 12 * 60 * 60;

#[derive(Debug, Error)]
pub enum PushError {
    /// The endpoint no longer exists; the subscription must be dropped.
    #[error("subscription gone")]
    Gone,

    #[error("push delivery failed: {0}")]
    Delivery(String),
}

#[async_trait]
pub trait PushProvider: Send + Sync {
    async fn deliver(&self, endpoint: &str, payload: &str) -> Result<(), PushError>;
}

#[derive(Debug, Serialize)]
struct VapidClaims {
    aud: String,
    exp: i64,
    sub: String,
}

/// VAPID-authenticated delivery over HTTP.
pub struct WebPushProvider {
    client: reqwest::Client,
    signing_key: EncodingKey,
    public_key: String,
    subject: String,
}

impl WebPushProvider {
    /// The private key is a base64url PKCS#8 DER EC key, as minted by the
    /// platform's key generator.
    pub fn new(vapid: &VapidSettings) -> anyhow::Result<Self> {
        let der = URL_SAFE_NO_PAD
            .decode(vapid.private_key.trim_end_matches('='))
            .map_err(|err| anyhow::anyhow!("decoding VAPID private key: {err}"))?;
        let signing_key = EncodingKey::from_ec_der(&der);

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Ok(Self {
            client,
            signing_key,
            public_key: vapid.public_key.clone(),
            subject: vapid.subject.clone(),
        })
    }

    fn vapid_token(&self, endpoint: &str) -> Result<String, PushError> {
        let url = reqwest::Url::parse(endpoint)
            .map_err(|err| PushError::Delivery(format!("bad endpoint: {err}")))?;
        let aud = format!(
            "{}://{}",
            url.scheme(),
            url.host_str().unwrap_or_default()
        );

        let claims = VapidClaims {
            aud,
            exp: Utc::now().timestamp() + VAPID_EXP_SECS,
            sub: self.subject.clone(),
        };
        encode(&Header::new(Algorithm::ES256), &claims, &self.signing_key)
            .map_err(|err| PushError::Delivery(format!("signing VAPID token: {err}")))
    }
}

#[async_trait]
impl PushProvider for WebPushProvider {
    async fn deliver(&self, endpoint: &str, payload: &str) -> Result<(), PushError> {
        let token = self.vapid_token(endpoint)?;

        let response = self
            .client
            .post(endpoint)
            .header(
                "Authorization",
                format!("vapid t={token}, k={}", self.public_key),
            )
            .header("TTL", PUSH_TTL_SECS)
            .header("Urgency", "normal")
            .header("Content-Type", "application/json")
            .body(payload.to_string())
            .send()
            .await
            .map_err(|err| PushError::Delivery(err.to_string()))?;

        match response.status().as_u16() {
            200..=299 => Ok(()),
            404 | 410 => Err(PushError::Gone),
            status => {
                debug!("push endpoint {endpoint} answered {status}");
                Err(PushError::Delivery(format!("status {status}")))
            }
        }
    }
}

/// Provider used when no VAPID keys are configured.
pub struct DisabledPushProvider;

#[async_trait]
impl PushProvider for DisabledPushProvider {
    async fn deliver(&self, _endpoint: &str, _payload: &str) -> Result<(), PushError> {
        Ok(())
    }
}
