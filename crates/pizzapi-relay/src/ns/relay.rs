//! `/relay` namespace — the producer (TUI/agent) side of a session.
//!
//! The handshake carries the session id and the producer bearer token the
//! CLI minted. At most one producer socket is attached to a session at a
//! time; the token plus the `isActive` flag in the state store enforce that
//! across nodes.

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{HeaderMap, Uri},
    response::Response,
};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use nanoid::nanoid;
use pizzapi_protocol::hub::HubServerEvent;
use pizzapi_protocol::relay::{RelayClientEvent, RelayServerEvent};
use pizzapi_protocol::viewer::ViewerServerEvent;
use serde::Deserialize;

use crate::api::{ApiError, AppState};
use crate::persist::SessionStartInput;
use crate::push::{PushEventKind, PushNotification};
use crate::registry::SocketHandle;
use crate::store::SessionData;
use crate::util::{deadline_ms, now_ms};

use super::{ingest_agent_event, touch_session};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayHandshake {
    #[serde(default)]
    session_id: Option<String>,
    token: String,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    session_name: Option<String>,
    #[serde(default)]
    collab_mode: Option<bool>,
    /// Sessions are ephemeral unless the producer opts out.
    #[serde(default)]
    ephemeral: Option<bool>,
}

/// GET /relay
pub async fn relay_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
    axum::extract::Query(handshake): axum::extract::Query<RelayHandshake>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let identity = state
        .gate
        .authenticate_api_key(&headers, uri.query())
        .await?;

    let (session, resumed) = resolve_producer_session(&state, &identity.user_id, &identity.user_name, handshake).await?;

    info!(
        "producer attached to session {} (resumed: {resumed})",
        session.session_id
    );
    Ok(ws.on_upgrade(move |socket| handle_producer(socket, state, session, resumed)))
}

/// Find or create the session for a producer handshake, enforcing the
/// token and the single-producer rule.
async fn resolve_producer_session(
    state: &AppState,
    user_id: &str,
    user_name: &str,
    handshake: RelayHandshake,
) -> Result<(SessionData, bool), ApiError> {
    if let Some(session_id) = &handshake.session_id {
        if let Some(existing) = state.store.get_session(session_id).await {
            if existing.token != handshake.token {
                warn!("producer presented a wrong token for session {session_id}");
                return Err(ApiError::Unauthorized);
            }
            if existing.is_active || state.registry.has_local_tui(session_id) {
                warn!("duplicate producer rejected for session {session_id}");
                return Err(ApiError::Unauthorized);
            }
            return Ok((existing, true));
        }
    }

    let session_id = handshake
        .session_id
        .unwrap_or_else(|| nanoid!());
    let is_ephemeral = handshake.ephemeral.unwrap_or(true);
    let session = SessionData {
        share_url: format!("{}/s/{session_id}", state.settings.share_url_base),
        session_id,
        token: handshake.token,
        cwd: handshake.cwd.unwrap_or_default(),
        started_at: now_ms(),
        user_id: user_id.to_string(),
        user_name: user_name.to_string(),
        session_name: handshake.session_name,
        collab_mode: handshake.collab_mode.unwrap_or(false),
        is_active: true,
        last_heartbeat_at: None,
        last_heartbeat: None,
        last_state: None,
        runner_id: None,
        runner_name: None,
        is_ephemeral,
        expires_at: is_ephemeral.then(|| deadline_ms(state.settings.ephemeral_ttl)),
    };

    state.store.create_session(&session).await;
    if let Err(err) = state
        .archive
        .record_start(&SessionStartInput {
            session_id: session.session_id.clone(),
            user_id: session.user_id.clone(),
            user_name: session.user_name.clone(),
            session_name: session.session_name.clone(),
            cwd: session.cwd.clone(),
            share_url: session.share_url.clone(),
            is_ephemeral: session.is_ephemeral,
        })
        .await
    {
        warn!("failed to persist session start: {err:#}");
    }
    if !session.cwd.is_empty() {
        let _ = state
            .archive
            .record_recent_folder(&session.user_id, &session.cwd)
            .await;
    }

    state.registry.send_to_user_hubs(
        &session.user_id,
        &HubServerEvent::SessionStarted {
            session_id: session.session_id.clone(),
        },
    );
    state
        .push
        .send_to_user(
            &session.user_id,
            &PushNotification::new(
                PushEventKind::SessionStarted,
                "Session started",
                session
                    .session_name
                    .clone()
                    .unwrap_or_else(|| session.session_id.clone()),
            )
            .with_session(&session.session_id),
        )
        .await;

    Ok((session, false))
}

async fn handle_producer(
    socket: WebSocket,
    state: AppState,
    session: SessionData,
    resumed: bool,
) {
    let session_id = session.session_id.clone();
    let (mut sender, mut receiver) = socket.split();

    let (handle, mut outbound) = SocketHandle::new();
    let conn_id = handle.conn_id;
    state.registry.set_tui(&session_id, handle);
    state
        .store
        .set_session_active(
            &session_id,
            true,
            Some(deadline_ms(state.settings.ephemeral_ttl)),
        )
        .await;

    let registered = RelayServerEvent::SessionRegistered {
        session_id: session_id.clone(),
        share_url: Some(session.share_url.clone()),
        resumed,
    };
    if let Ok(ack) = serde_json::to_string(&registered) {
        if sender.send(Message::Text(ack.into())).await.is_err() {
            state.registry.remove_tui(&session_id, conn_id);
            return;
        }
    }

    // Forward queued server->producer events (collab input, execs) to the
    // socket.
    let send_task = tokio::spawn(async move {
        while let Some(payload) = outbound.recv().await {
            if sender.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                match serde_json::from_str::<RelayClientEvent>(&text) {
                    Ok(event) => handle_producer_event(&state, &session_id, event).await,
                    Err(err) => {
                        debug!("dropping malformed producer event on {session_id}: {err}");
                    }
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    send_task.abort();
    state.registry.remove_tui(&session_id, conn_id);
    producer_disconnected(&state, &session_id).await;
}

async fn handle_producer_event(state: &AppState, session_id: &str, event: RelayClientEvent) {
    // The session can expire mid-connection; treat its absence as a no-op.
    let Some(session) = state.store.get_session(session_id).await else {
        debug!("event for vanished session {session_id} dropped");
        return;
    };

    match event {
        RelayClientEvent::Heartbeat { payload } => {
            state
                .store
                .record_heartbeat(session_id, now_ms(), &payload)
                .await;
            state
                .fan_out(
                    session_id,
                    &ViewerServerEvent::Event {
                        event: payload,
                        seq: None,
                        replay: false,
                    },
                )
                .await;
            touch_session(state, &session).await;
        }

        RelayClientEvent::AgentEvent { event } => {
            ingest_agent_event(state, &session, event).await;
        }

        RelayClientEvent::StateUpdate { state: new_state } => {
            state.store.record_state(session_id, &new_state).await;
            if let Err(err) = state.archive.record_state(session_id, &new_state).await {
                debug!("failed to persist state for {session_id}: {err:#}");
            }
            state
                .fan_out(
                    session_id,
                    &ViewerServerEvent::Event {
                        event: serde_json::json!({"type": "session_active", "state": new_state}),
                        seq: None,
                        replay: false,
                    },
                )
                .await;
            touch_session(state, &session).await;
        }

        RelayClientEvent::ExecResult(result) => {
            let event = ViewerServerEvent::ExecResult(result.clone());
            match state.registry.take_exec(&result.id) {
                Some(route) if route.session_id == session_id => {
                    route.viewer.send_event(&event);
                }
                Some(route) => {
                    // Wrong session: put nothing back, just drop it.
                    debug!(
                        "exec result {} targeted session {} but arrived on {session_id}",
                        result.id, route.session_id
                    );
                }
                // The issuing viewer lives on another node.
                None => state.bus.publish_exec_result(session_id, &event).await,
            }
        }
    }
}

/// Producer went away: keep the session viewable, stop marking it live.
async fn producer_disconnected(state: &AppState, session_id: &str) {
    info!("producer disconnected from session {session_id}");
    state
        .store
        .set_session_active(
            session_id,
            false,
            Some(deadline_ms(state.settings.ephemeral_ttl)),
        )
        .await;
    if let Err(err) = state.archive.touch(session_id).await {
        debug!("failed to touch persisted session {session_id}: {err:#}");
    }
    state
        .fan_out(
            session_id,
            &ViewerServerEvent::Disconnected { reason: None },
        )
        .await;
}
