//! Test utilities and common setup.

use axum::Router;
use std::sync::Arc;
use std::time::Duration;

use pizzapi_relay::api::{self, AppState};
use pizzapi_relay::attachments::AttachmentStore;
use pizzapi_relay::auth::{AuthGate, AuthIdentity, StaticAuthProvider};
use pizzapi_relay::bus::RelayBus;
use pizzapi_relay::events::EventCache;
use pizzapi_relay::persist::{Database, SessionArchive};
use pizzapi_relay::push::{DisabledPushProvider, PushNotifier};
use pizzapi_relay::registry::Registry;
use pizzapi_relay::settings::{OrgSettings, RelaySettings};
use pizzapi_relay::store::{KvBackend, MemoryBackend, RelayStore};

/// The exact Cookie header the tests send.
pub const TEST_COOKIE: &str = "pizzapi.sid=test-session";

pub fn test_identity() -> AuthIdentity {
    AuthIdentity {
        user_id: "u-test".into(),
        user_name: "Test User".into(),
    }
}

/// Build a full application state on in-memory backends.
pub async fn test_state(org: Option<OrgSettings>) -> AppState {
    let mut settings = RelaySettings::default();
    settings.org = org;
    settings.ephemeral_ttl = Duration::from_secs(600);
    settings.attachment_dir =
        std::env::temp_dir().join(format!("pizzapi-it-{}", uuid::Uuid::new_v4()));

    let backend: Arc<dyn KvBackend> = Arc::new(MemoryBackend::new());
    let store = RelayStore::new(backend.clone(), None);
    let events = EventCache::new(
        backend.clone(),
        store.keys().clone(),
        settings.event_buffer_size,
        settings.event_ttl,
        settings.ephemeral_ttl,
    );
    let db = Database::in_memory().await.unwrap();
    let archive = SessionArchive::new(db.pool().clone(), settings.ephemeral_ttl);
    let registry = Arc::new(Registry::new(store.clone()));
    let bus = Arc::new(RelayBus::new(backend, store.keys().bus_channel()));

    let provider = StaticAuthProvider::new().with_cookie(TEST_COOKIE, test_identity());
    let gate = Arc::new(AuthGate::new(
        Arc::new(provider),
        None,
        Vec::new(),
        settings.session_cookie.clone(),
    ));

    let push = PushNotifier::new(db.pool().clone(), Arc::new(DisabledPushProvider));
    let attachments = AttachmentStore::new(
        settings.attachment_dir.clone(),
        settings.attachment_ttl,
        settings.attachment_max_bytes,
    );

    AppState {
        settings: Arc::new(settings),
        store,
        events,
        archive,
        registry,
        bus,
        gate,
        push,
        attachments,
    }
}

/// Create a test application router plus its state.
pub async fn test_app() -> (Router, AppState) {
    let state = test_state(None).await;
    (api::create_router(state.clone()), state)
}

/// Multi-tenant variant for the caddy validation tests.
pub async fn test_app_with_org(org_slug: &str) -> Router {
    let state = test_state(Some(OrgSettings {
        org_id: "org-1".into(),
        org_slug: org_slug.into(),
        jwks_url: "http://127.0.0.1:0/jwks.json".into(),
    }))
    .await;
    api::create_router(state)
}
