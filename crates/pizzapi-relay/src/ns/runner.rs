//! `/runner` namespace — long-lived runner daemons.
//!
//! A runner registers once per connection, then executes session and
//! terminal lifecycle commands and streams worker-produced events back up.
//! Per-socket state machine: connecting -> registered -> closed; everything
//! before `register_runner` except the registration itself is an error.

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
use pizzapi_protocol::runner::{RunnerClientEvent, RunnerServerEvent};
use pizzapi_protocol::terminal::TerminalServerEvent;
use pizzapi_protocol::viewer::ViewerServerEvent;
use serde_json::json;

use crate::api::{ApiError, AppState};
use crate::auth::AuthIdentity;
use crate::push::{PushEventKind, PushNotification};
use crate::registry::SocketHandle;
use crate::store::RunnerData;
use crate::util::deadline_ms;

use super::{end_session, ingest_agent_event, touch_session};

/// Keepalive interval on the runner socket.
const PING_INTERVAL_SECS: u64 = 30;

/// GET /runner
pub async fn runner_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let identity = state
        .gate
        .authenticate_runner(&headers, uri.query())
        .await?;

    Ok(ws.on_upgrade(move |socket| handle_runner(socket, state, identity)))
}

async fn handle_runner(socket: WebSocket, state: AppState, identity: AuthIdentity) {
    let (mut sender, mut receiver) = socket.split();

    let (handle, mut outbound) = SocketHandle::new();
    let conn_id = handle.conn_id;
    let mut runner_id: Option<String> = None;

    let send_task = tokio::spawn(async move {
        let mut ping_interval =
            tokio::time::interval(std::time::Duration::from_secs(PING_INTERVAL_SECS));
        loop {
            tokio::select! {
                payload = outbound.recv() => {
                    let Some(payload) = payload else { break };
                    if sender.send(Message::Text(payload.into())).await.is_err() {
                        break;
                    }
                }
                // Liveness probe; the runner's reply traffic refreshes its
                // TTL on the inbound side.
                _ = ping_interval.tick() => {
                    let Ok(ping) = serde_json::to_string(&RunnerServerEvent::Ping) else {
                        continue;
                    };
                    if sender.send(Message::Text(ping.into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    while let Some(message) = receiver.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        let event = match serde_json::from_str::<RunnerClientEvent>(&text) {
            Ok(event) => event,
            Err(err) => {
                debug!("dropping malformed runner event: {err}");
                continue;
            }
        };

        match event {
            RunnerClientEvent::RegisterRunner { runner_id: proposed, name, roots, skills } => {
                if runner_id.is_some() {
                    debug!("ignoring re-registration on an already-registered runner socket");
                    continue;
                }
                let assigned =
                    register_runner(&state, &identity, proposed, name, roots, skills).await;
                state.registry.set_runner(&assigned, handle.clone());
                handle.send_event(&RunnerServerEvent::RunnerRegistered {
                    runner_id: assigned.clone(),
                });
                runner_id = Some(assigned);
            }
            event => {
                let Some(id) = runner_id.clone() else {
                    handle.send_event(&RunnerServerEvent::Error {
                        message: "register_runner required first".to_string(),
                    });
                    continue;
                };
                // Any traffic proves liveness.
                state.store.touch_runner(&id).await;
                handle_runner_event(&state, &identity, &id, event).await;
            }
        }
    }

    send_task.abort();
    if let Some(runner_id) = runner_id {
        state.registry.remove_runner(&runner_id, conn_id);
        state.registry.send_to_user_hubs(
            &identity.user_id,
            &HubServerEvent::RunnerDisconnected {
                runner_id: runner_id.clone(),
            },
        );
        info!("runner {runner_id} disconnected");
    }
}

/// Settle the authoritative runner id: the proposed one if it is free (or
/// already this user's), a fresh one otherwise.
async fn register_runner(
    state: &AppState,
    identity: &AuthIdentity,
    proposed: Option<String>,
    name: Option<String>,
    roots: Vec<String>,
    skills: Vec<pizzapi_protocol::RunnerSkill>,
) -> String {
    let runner_id = match proposed {
        Some(id) => match state.store.get_runner(&id).await {
            None => id,
            Some(existing) if existing.user_id == identity.user_id => id,
            Some(_) => {
                warn!("runner id {id} is taken; minting a fresh one");
                nanoid!()
            }
        },
        None => nanoid!(),
    };

    let runner = RunnerData {
        runner_id: runner_id.clone(),
        user_id: identity.user_id.clone(),
        user_name: identity.user_name.clone(),
        name: name.clone(),
        roots,
        skills,
    };
    state.store.put_runner(&runner).await;

    state.registry.send_to_user_hubs(
        &identity.user_id,
        &HubServerEvent::RunnerConnected {
            runner_id: runner_id.clone(),
            name,
        },
    );
    info!("runner {runner_id} registered for user {}", identity.user_id);
    runner_id
}

async fn handle_runner_event(
    state: &AppState,
    identity: &AuthIdentity,
    runner_id: &str,
    event: RunnerClientEvent,
) {
    match event {
        RunnerClientEvent::RegisterRunner { .. } => {
            debug!("re-registration reached the dispatcher; dropped");
        }

        RunnerClientEvent::SkillsList { skills } => {
            let serialized = serde_json::to_string(&skills).unwrap_or_else(|_| "[]".into());
            state
                .store
                .update_runner(runner_id, vec![("skills".into(), serialized)])
                .await;
        }

        // Command replies go back to the user's dashboard sockets, mapped
        // onto the hub wire contract.
        RunnerClientEvent::SkillResult { id, ok, skill, error } => {
            state.registry.send_to_user_hubs(
                &identity.user_id,
                &HubServerEvent::SkillResult { id, ok, skill, error },
            );
        }
        RunnerClientEvent::FileResult { id, ok, data, error } => {
            state.registry.send_to_user_hubs(
                &identity.user_id,
                &HubServerEvent::FileResult { id, ok, data, error },
            );
        }

        RunnerClientEvent::RunnerSessionEvent { session_id, event } => {
            bind_pending_link(state, runner_id, &session_id).await;
            match state.store.get_session(&session_id).await {
                Some(session) => {
                    ingest_agent_event(state, &session, event).await;
                }
                None => {
                    debug!("runner event for unknown session {session_id} dropped");
                }
            }
        }

        RunnerClientEvent::SessionReady { session_id } => {
            bind_pending_link(state, runner_id, &session_id).await;
            let Some(session) = state.store.get_session(&session_id).await else {
                return;
            };
            state
                .store
                .set_session_active(
                    &session_id,
                    true,
                    Some(deadline_ms(state.settings.ephemeral_ttl)),
                )
                .await;
            state
                .fan_out(
                    &session_id,
                    &ViewerServerEvent::Event {
                        event: json!({"type": "session_ready"}),
                        seq: None,
                        replay: false,
                    },
                )
                .await;
            touch_session(state, &session).await;
        }

        RunnerClientEvent::SessionError { session_id, error } => {
            let Some(session) = state.store.get_session(&session_id).await else {
                debug!("error for unknown session {session_id}: {error}");
                return;
            };
            state
                .store
                .set_session_active(&session_id, false, None)
                .await;
            state
                .fan_out(
                    &session_id,
                    &ViewerServerEvent::Event {
                        event: json!({"type": "session_error", "error": error}),
                        seq: None,
                        replay: false,
                    },
                )
                .await;
            state
                .push
                .send_to_user(
                    &session.user_id,
                    &PushNotification::new(
                        PushEventKind::AgentError,
                        "Session failed",
                        session
                            .session_name
                            .clone()
                            .unwrap_or_else(|| session_id.clone()),
                    )
                    .with_session(&session_id),
                )
                .await;
        }

        RunnerClientEvent::SessionKilled { session_id } => {
            // Killing a session that is already gone is a no-op.
            if let Some(session) = state.store.get_session(&session_id).await {
                end_session(state, &session, "Session killed").await;
            }
        }

        RunnerClientEvent::TerminalReady { terminal_id } => {
            state
                .store
                .update_terminal(&terminal_id, vec![("spawned".into(), "1".into())])
                .await;
            state
                .registry
                .send_to_terminal_clients(&terminal_id, &TerminalServerEvent::Ready);
        }

        RunnerClientEvent::TerminalData { terminal_id, data } => {
            state
                .registry
                .send_to_terminal_clients(&terminal_id, &TerminalServerEvent::Data { data });
        }

        RunnerClientEvent::TerminalExit { terminal_id, exit_code } => {
            state
                .registry
                .send_to_terminal_clients(&terminal_id, &TerminalServerEvent::Exit { exit_code });
            state.store.delete_terminal(&terminal_id, runner_id).await;
        }

        RunnerClientEvent::TerminalError { terminal_id, error } => {
            state.registry.send_to_terminal_clients(
                &terminal_id,
                &TerminalServerEvent::Error { message: error },
            );
        }
    }
}

/// Consume the pending spawn link on the first sign of life from the
/// runner and bind the session to it.
async fn bind_pending_link(state: &AppState, runner_id: &str, session_id: &str) {
    if state.store.take_pending_link(session_id).await.is_some() {
        let runner_name = state
            .store
            .get_runner(runner_id)
            .await
            .and_then(|runner| runner.name);
        state
            .store
            .bind_runner(session_id, runner_id, runner_name.as_deref())
            .await;
        debug!("session {session_id} bound to runner {runner_id}");
    }
}
