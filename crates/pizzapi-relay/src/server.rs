//! Server assembly: wire settings into components and run.

use anyhow::{Context, Result};
use log::{info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::api::{AppState, create_router};
use crate::attachments::AttachmentStore;
use crate::auth::{
    AuthGate, AuthProvider, HttpAuthProvider, OrgTokenValidator, StaticAuthProvider,
};
use crate::bus::RelayBus;
use crate::events::EventCache;
use crate::persist::{Database, SessionArchive};
use crate::push::{DisabledPushProvider, PushNotifier, PushProvider, WebPushProvider};
use crate::registry::Registry;
use crate::settings::RelaySettings;
use crate::store::{KvBackend, MemoryBackend, RedisBackend, RelayStore};
use crate::sweeper;

/// Build the application state from settings.
pub async fn build_state(settings: RelaySettings) -> Result<AppState> {
    let backend: Arc<dyn KvBackend> = match &settings.redis_url {
        Some(url) => {
            info!("using shared redis state store");
            Arc::new(RedisBackend::connect(url).await?)
        }
        None => {
            info!("no redis configured; running single-node with in-memory state");
            Arc::new(MemoryBackend::new())
        }
    };

    let store = RelayStore::new(backend.clone(), settings.redis_prefix.as_deref());
    let events = EventCache::new(
        backend.clone(),
        store.keys().clone(),
        settings.event_buffer_size,
        settings.event_ttl,
        settings.ephemeral_ttl,
    );

    let db = Database::new(&settings.database_path).await?;
    let archive = SessionArchive::new(db.pool().clone(), settings.ephemeral_ttl);

    let registry = Arc::new(Registry::new(store.clone()));
    let bus = Arc::new(RelayBus::new(backend, store.keys().bus_channel()));

    let provider: Arc<dyn AuthProvider> = match &settings.auth_provider_url {
        Some(url) => Arc::new(HttpAuthProvider::new(url.clone())),
        None => {
            warn!("no auth provider configured; running in single-user mode");
            Arc::new(StaticAuthProvider::single_user())
        }
    };
    let org_tokens = settings
        .org
        .as_ref()
        .map(|org| Arc::new(OrgTokenValidator::new(&org.jwks_url, &org.org_id, &org.org_slug)));
    let gate = Arc::new(AuthGate::new(
        provider,
        org_tokens,
        settings.trusted_origins.clone(),
        settings.session_cookie.clone(),
    ));

    let push_provider: Arc<dyn PushProvider> = match &settings.vapid {
        Some(vapid) => Arc::new(WebPushProvider::new(vapid).context("configuring web push")?),
        None => Arc::new(DisabledPushProvider),
    };
    let push = PushNotifier::new(db.pool().clone(), push_provider);

    let attachments = AttachmentStore::new(
        settings.attachment_dir.clone(),
        settings.attachment_ttl,
        settings.attachment_max_bytes,
    );

    Ok(AppState {
        settings: Arc::new(settings),
        store,
        events,
        archive,
        registry,
        bus,
        gate,
        push,
        attachments,
    })
}

/// Run the relay until SIGINT/SIGTERM.
pub async fn serve(settings: RelaySettings) -> Result<()> {
    // The HTTP trace layer emits tracing events; everything else logs via
    // `log`. Both get their own subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let port = settings.port;
    let state = build_state(settings).await?;

    let shutdown = CancellationToken::new();
    state
        .bus
        .clone()
        .start(state.registry.clone(), shutdown.clone())
        .await
        .context("attaching cross-node bus")?;
    let sweeper_task = sweeper::spawn(state.clone(), shutdown.clone());

    let app = create_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("relay listening on {addr}");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            wait_for_signal().await;
            server_shutdown.cancel();
        })
        .await
        .context("serving")?;

    shutdown.cancel();
    let _ = sweeper_task.await;
    info!("relay stopped");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("installing SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
