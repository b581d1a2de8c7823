//! `/viewer` namespace — browsers subscribed to a session.
//!
//! Live sessions get the room treatment: a `connected` ack, the latest
//! snapshot, then the ordered event stream. Dead sessions get a one-shot
//! persisted-snapshot replay and are disconnected.

use axum::{
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::HeaderMap,
    response::Response,
};
use futures::{SinkExt, StreamExt};
use futures::stream::SplitSink;
use log::{debug, info};
use pizzapi_protocol::relay::RelayServerEvent;
use pizzapi_protocol::viewer::{ViewerClientEvent, ViewerServerEvent};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::api::{ApiError, AppState};
use crate::auth::AuthIdentity;
use crate::events::EventCache;
use crate::registry::SocketHandle;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerHandshake {
    #[serde(default)]
    session_id: Option<String>,
}

/// GET /viewer
pub async fn viewer_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(handshake): Query<ViewerHandshake>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let identity = state.gate.authenticate_viewer(&headers).await?;
    let session_id = handshake
        .session_id
        .ok_or_else(|| ApiError::bad_request("sessionId is required"))?;

    Ok(ws.on_upgrade(move |socket| handle_viewer(socket, state, session_id, identity)))
}

async fn handle_viewer(
    socket: WebSocket,
    state: AppState,
    session_id: String,
    identity: AuthIdentity,
) {
    let (mut sender, mut receiver) = socket.split();

    let (handle, mut outbound) = SocketHandle::new();
    let conn_id = handle.conn_id;

    // A session is live only while its producer is attached. Anything else
    // gets a one-shot persisted-snapshot replay and a goodbye.
    let live = state
        .store
        .get_session(&session_id)
        .await
        .is_some_and(|session| session.is_active);
    if !live || !state.registry.join_viewer(&session_id, handle.clone()).await {
        replay_persisted_snapshot(&state, &session_id, &mut sender).await;
        let _ = sender.close().await;
        return;
    }

    info!("viewer {} joined session {session_id}", identity.user_id);
    state
        .registry
        .send_snapshot_to_viewer(&session_id, &handle)
        .await;

    let send_task = tokio::spawn(async move {
        while let Some(payload) = outbound.recv().await {
            if sender.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<ViewerClientEvent>(&text) {
                Ok(event) => {
                    handle_viewer_event(&state, &session_id, &identity, &handle, event).await;
                }
                Err(err) => {
                    debug!("dropping malformed viewer event on {session_id}: {err}");
                }
            },
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    send_task.abort();
    state.registry.leave_viewer(&session_id, conn_id);
    debug!("viewer {} left session {session_id}", identity.user_id);
}

async fn handle_viewer_event(
    state: &AppState,
    session_id: &str,
    identity: &AuthIdentity,
    handle: &SocketHandle,
    event: ViewerClientEvent,
) {
    match event {
        ViewerClientEvent::Connected => {
            // Let the TUI know someone is watching so it can push
            // capability info. Local producers only; a greeting is not
            // worth a bus round-trip.
            if let Some(tui) = state.registry.tui(session_id) {
                tui.send_event(&RelayServerEvent::ViewerConnected);
            }
        }

        ViewerClientEvent::Resync => {
            state
                .registry
                .send_snapshot_to_viewer(session_id, handle)
                .await;
        }

        ViewerClientEvent::Input(mut input) => {
            if !collab_enabled(state, session_id).await {
                return;
            }
            // Only addressable attachment references survive.
            input.attachments.retain(|attachment| {
                let keep = attachment.is_addressable();
                if !keep {
                    debug!("dropping non-addressable attachment on {session_id}");
                }
                keep
            });
            input.user_name = Some(identity.user_name.clone());
            state
                .to_producer(session_id, &RelayServerEvent::Input(input))
                .await;
        }

        ViewerClientEvent::ModelSet { provider, model_id } => {
            if !collab_enabled(state, session_id).await {
                return;
            }
            state
                .to_producer(session_id, &RelayServerEvent::ModelSet { provider, model_id })
                .await;
        }

        ViewerClientEvent::Exec(exec) => {
            if !collab_enabled(state, session_id).await {
                return;
            }
            state
                .registry
                .register_exec(&exec.id, session_id, handle.clone());
            state
                .to_producer(session_id, &RelayServerEvent::Exec(exec))
                .await;
        }
    }
}

async fn collab_enabled(state: &AppState, session_id: &str) -> bool {
    match state.store.get_session(session_id).await {
        Some(session) => session.collab_mode,
        None => false,
    }
}

/// The session is no longer live: replay the best snapshot we still have,
/// then say goodbye. Order: `connected{replayOnly}`, one snapshot event (or
/// an error when nothing is left), `disconnected`.
async fn replay_persisted_snapshot(
    state: &AppState,
    session_id: &str,
    sender: &mut SplitSink<WebSocket, Message>,
) {
    send_json(
        sender,
        &ViewerServerEvent::Connected {
            session_id: session_id.to_string(),
            last_seq: state.store.last_seq(session_id).await,
            is_active: false,
            last_heartbeat_at: None,
            session_name: None,
            replay_only: true,
        },
    )
    .await;

    let cached = state.events.get_all(session_id).await;
    if let Some(snapshot) = EventCache::find_latest_snapshot(&cached) {
        send_json(
            sender,
            &ViewerServerEvent::Event {
                event: snapshot.clone(),
                seq: None,
                replay: true,
            },
        )
        .await;
    } else {
        let persisted = state
            .archive
            .get_snapshot(session_id)
            .await
            .ok()
            .flatten()
            .and_then(|snapshot| snapshot.state);
        match persisted {
            Some(persisted_state) => {
                send_json(
                    sender,
                    &ViewerServerEvent::Event {
                        event: json!({"type": "session_active", "state": persisted_state}),
                        seq: None,
                        replay: true,
                    },
                )
                .await;
            }
            None => {
                send_json(
                    sender,
                    &ViewerServerEvent::Error {
                        message: "Session not found".to_string(),
                    },
                )
                .await;
                return;
            }
        }
    }

    send_json(
        sender,
        &ViewerServerEvent::Disconnected {
            reason: Some("Session is no longer live (snapshot replay).".to_string()),
        },
    )
    .await;
}

async fn send_json<T: Serialize>(sender: &mut SplitSink<WebSocket, Message>, event: &T) {
    if let Ok(payload) = serde_json::to_string(event) {
        let _ = sender.send(Message::Text(payload.into())).await;
    }
}
