//! Shared state construction for unit tests.

use std::sync::Arc;
use std::time::Duration;

use crate::api::AppState;
use crate::attachments::AttachmentStore;
use crate::auth::{AuthGate, StaticAuthProvider};
use crate::bus::RelayBus;
use crate::events::EventCache;
use crate::persist::{Database, SessionArchive};
use crate::push::{DisabledPushProvider, PushNotifier};
use crate::registry::Registry;
use crate::settings::RelaySettings;
use crate::store::{KvBackend, MemoryBackend, RelayStore};

/// An [`AppState`] on a memory backend and an in-memory database.
pub async fn test_state(ephemeral_ttl: Duration) -> AppState {
    let mut settings = RelaySettings::default();
    settings.ephemeral_ttl = ephemeral_ttl;
    settings.attachment_dir =
        std::env::temp_dir().join(format!("pizzapi-test-{}", nanoid::nanoid!()));

    let backend: Arc<dyn KvBackend> = Arc::new(MemoryBackend::new());
    let store = RelayStore::new(backend.clone(), None);
    let events = EventCache::new(
        backend.clone(),
        store.keys().clone(),
        settings.event_buffer_size,
        settings.event_ttl,
        settings.ephemeral_ttl,
    );
    let db = Database::in_memory().await.expect("in-memory database");
    let archive = SessionArchive::new(db.pool().clone(), settings.ephemeral_ttl);
    let registry = Arc::new(Registry::new(store.clone()));
    let bus = Arc::new(RelayBus::new(backend, store.keys().bus_channel()));
    let gate = Arc::new(AuthGate::new(
        Arc::new(StaticAuthProvider::single_user()),
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
