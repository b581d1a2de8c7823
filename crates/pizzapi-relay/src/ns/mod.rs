//! Socket namespaces.
//!
//! One module per client class, all multiplexed over the same port:
//! `/runner` (daemons), `/relay` (producer TUIs), `/viewer` (browsers),
//! `/terminal` (browser PTYs) and `/hub` (dashboards).

pub mod hub;
pub mod relay;
pub mod runner;
pub mod terminal;
pub mod viewer;

use log::debug;
use pizzapi_protocol::viewer::ViewerServerEvent;
use serde_json::Value;

use crate::api::AppState;
use crate::events::is_snapshot_event;
use crate::push::{PushEventKind, PushNotification};
use crate::store::SessionData;
use crate::util::deadline_ms;

/// Ingest one producer-published agent event: assign the seq, cache it,
/// capture snapshots, fan out to the room everywhere, refresh expiry, and
/// raise a push notification when the event warrants one.
///
/// Shared by the relay namespace (TUI-published) and the runner namespace
/// (worker-published).
pub(crate) async fn ingest_agent_event(
    state: &AppState,
    session: &SessionData,
    event: Value,
) -> u64 {
    let session_id = &session.session_id;
    let seq = state.store.increment_seq(session_id).await;

    state
        .events
        .append(session_id, &event, session.is_ephemeral)
        .await;

    if is_snapshot_event(&event) {
        let snapshot_state = match event.get("state") {
            Some(state) if !state.is_null() => state.clone(),
            _ => event.clone(),
        };
        state.store.record_state(session_id, &snapshot_state).await;
        if let Err(err) = state.archive.record_state(session_id, &snapshot_state).await {
            debug!("failed to persist snapshot for {session_id}: {err:#}");
        }
    }

    state
        .fan_out(
            session_id,
            &ViewerServerEvent::Event {
                event: event.clone(),
                seq: Some(seq),
                replay: false,
            },
        )
        .await;

    touch_session(state, session).await;
    notify_for_event(state, session, &event).await;
    seq
}

/// Push the session's idle expiry forward in both stores.
pub(crate) async fn touch_session(state: &AppState, session: &SessionData) {
    let deadline = deadline_ms(state.settings.ephemeral_ttl);
    state.store.touch_session(session, deadline).await;
    if let Err(err) = state.archive.touch(&session.session_id).await {
        debug!("failed to touch persisted session {}: {err:#}", session.session_id);
    }
}

/// Explicitly end a session: persist the end, tell the room, drop the
/// cached events and the live entry, and notify the owner. Callers pass a
/// session they already looked up, so ending an already-gone session is a
/// natural no-op at the lookup site.
pub(crate) async fn end_session(state: &AppState, session: &SessionData, reason: &str) {
    let session_id = &session.session_id;

    if let Err(err) = state.archive.record_end(session_id).await {
        debug!("failed to persist session end for {session_id}: {err:#}");
    }
    state
        .fan_out(
            session_id,
            &ViewerServerEvent::Disconnected {
                reason: Some(reason.to_string()),
            },
        )
        .await;
    state.events.delete(session_id).await;
    state
        .store
        .delete_session(session_id, &session.user_id)
        .await;

    state.registry.send_to_user_hubs(
        &session.user_id,
        &pizzapi_protocol::hub::HubServerEvent::SessionEnded {
            session_id: session_id.clone(),
        },
    );
    state
        .push
        .send_to_user(
            &session.user_id,
            &PushNotification::new(
                PushEventKind::SessionEnded,
                "Session ended",
                session
                    .session_name
                    .clone()
                    .unwrap_or_else(|| session_id.clone()),
            )
            .with_session(session_id),
        )
        .await;
}

/// Map push-worthy agent events to notifications for the session owner.
async fn notify_for_event(state: &AppState, session: &SessionData, event: &Value) {
    let kind = match event.get("type").and_then(Value::as_str) {
        Some("agent_end") => Some((PushEventKind::AgentFinished, "Agent finished")),
        Some("agent_error") => Some((PushEventKind::AgentError, "Agent hit an error")),
        Some("agent_needs_input") => {
            Some((PushEventKind::AgentNeedsInput, "Agent is waiting for input"))
        }
        _ => None,
    };

    if let Some((kind, title)) = kind {
        let body = session
            .session_name
            .clone()
            .unwrap_or_else(|| session.session_id.clone());
        state
            .push
            .send_to_user(
                &session.user_id,
                &PushNotification::new(kind, title, body).with_session(&session.session_id),
            )
            .await;
    }
}
