//! Opt-in push notifications.
//!
//! Users register endpoints per device; each subscription carries an event
//! allowlist (`*` or comma-separated). Delivery is fire-and-forget: failures
//! never reach the caller, and endpoints that answer gone/expired are
//! dropped.

mod provider;

pub use provider::{DisabledPushProvider, PushError, PushProvider, WebPushProvider};

use anyhow::{Context, Result};
use futures::future::join_all;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, SqlitePool};
use std::sync::Arc;

use crate::util::now_ms;

/// Notification kinds the relay emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushEventKind {
    AgentFinished,
    AgentError,
    AgentNeedsInput,
    SessionStarted,
    SessionEnded,
}

impl PushEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PushEventKind::AgentFinished => "agent_finished",
            PushEventKind::AgentError => "agent_error",
            PushEventKind::AgentNeedsInput => "agent_needs_input",
            PushEventKind::SessionStarted => "session_started",
            PushEventKind::SessionEnded => "session_ended",
        }
    }
}

/// A notification handed to the provider as JSON.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushNotification {
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl PushNotification {
    pub fn new(kind: PushEventKind, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            title: title.into(),
            body: body.into(),
            session_id: None,
            data: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PushSubscription {
    pub id: i64,
    pub user_id: String,
    pub endpoint: String,
    /// Client key material as sent by the browser, stored opaquely.
    pub keys: String,
    pub enabled_events: String,
    pub created_at: i64,
}

/// Whether a subscription wants a given event kind.
pub fn is_event_enabled(enabled_events: &str, kind: &str) -> bool {
    let enabled = enabled_events.trim();
    enabled == "*" || enabled.split(',').any(|entry| entry.trim() == kind)
}

/// Subscription rows plus fan-out.
#[derive(Clone)]
pub struct PushNotifier {
    pool: SqlitePool,
    provider: Arc<dyn PushProvider>,
}

impl PushNotifier {
    pub fn new(pool: SqlitePool, provider: Arc<dyn PushProvider>) -> Self {
        Self { pool, provider }
    }

    /// Upsert by `(user_id, endpoint)`; re-subscribing updates the
    /// allowlist and key material.
    pub async fn subscribe(
        &self,
        user_id: &str,
        endpoint: &str,
        keys: &Value,
        enabled_events: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO push_subscription (user_id, endpoint, keys, enabled_events, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (user_id, endpoint) DO UPDATE
            SET keys = excluded.keys, enabled_events = excluded.enabled_events
            "#,
        )
        .bind(user_id)
        .bind(endpoint)
        .bind(keys.to_string())
        .bind(enabled_events.unwrap_or("*"))
        .bind(now_ms())
        .execute(&self.pool)
        .await
        .context("saving push subscription")?;
        Ok(())
    }

    pub async fn unsubscribe(&self, user_id: &str, endpoint: &str) -> Result<()> {
        sqlx::query("DELETE FROM push_subscription WHERE user_id = ? AND endpoint = ?")
            .bind(user_id)
            .bind(endpoint)
            .execute(&self.pool)
            .await
            .context("removing push subscription")?;
        Ok(())
    }

    pub async fn unsubscribe_by_id(&self, user_id: &str, subscription_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM push_subscription WHERE user_id = ? AND id = ?")
            .bind(user_id)
            .bind(subscription_id)
            .execute(&self.pool)
            .await
            .context("removing push subscription")?;
        Ok(())
    }

    pub async fn update_enabled_events(
        &self,
        user_id: &str,
        endpoint: &str,
        events: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE push_subscription SET enabled_events = ? WHERE user_id = ? AND endpoint = ?",
        )
        .bind(events)
        .bind(user_id)
        .bind(endpoint)
        .execute(&self.pool)
        .await
        .context("updating enabled events")?;
        Ok(())
    }

    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<PushSubscription>> {
        let subscriptions = sqlx::query_as::<_, PushSubscription>(
            "SELECT id, user_id, endpoint, keys, enabled_events, created_at
             FROM push_subscription WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("listing push subscriptions")?;
        Ok(subscriptions)
    }

    /// Fan a notification out to every matching endpoint in parallel.
    /// Fire-and-forget: delivery failures are logged, gone endpoints are
    /// removed, nothing is surfaced to the caller.
    pub async fn send_to_user(&self, user_id: &str, notification: &PushNotification) {
        let subscriptions = match self.list_for_user(user_id).await {
            Ok(subscriptions) => subscriptions,
            Err(err) => {
                warn!("push fan-out skipped, cannot list subscriptions: {err:#}");
                return;
            }
        };

        let Ok(payload) = serde_json::to_string(notification) else {
            return;
        };

        let deliveries = subscriptions
            .into_iter()
            .filter(|sub| is_event_enabled(&sub.enabled_events, &notification.kind))
            .map(|sub| {
                let provider = self.provider.clone();
                let payload = payload.clone();
                async move {
                    let outcome = provider.deliver(&sub.endpoint, &payload).await;
                    (sub, outcome)
                }
            });

        for (sub, outcome) in join_all(deliveries).await {
            match outcome {
                Ok(()) => {}
                Err(PushError::Gone) => {
                    debug!("push endpoint gone, removing subscription {}", sub.id);
                    if let Err(err) = self.unsubscribe(&sub.user_id, &sub.endpoint).await {
                        warn!("failed to drop gone subscription: {err:#}");
                    }
                }
                Err(err) => {
                    debug!("push delivery to subscription {} failed: {err}", sub.id);
                }
            }
        }
    }
}
