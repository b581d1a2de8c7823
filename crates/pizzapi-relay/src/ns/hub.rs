//! `/hub` namespace — per-user dashboard sockets.
//!
//! Emits the user's runner and session listings on connect and again on
//! request, pushes lifecycle changes as they happen, and originates the
//! runner command catalog (skills, files, git, runner-local listings).
//! Replies come back as `skill_result`/`file_result` keyed by the command
//! id once the runner namespace hears from the runner.

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::HeaderMap,
    response::Response,
};
use futures::{SinkExt, StreamExt};
use log::debug;
use pizzapi_protocol::hub::{HubClientEvent, HubServerEvent};
use pizzapi_protocol::runner::RunnerServerEvent;

use crate::api::{ApiError, AppState};
use crate::auth::AuthIdentity;
use crate::registry::SocketHandle;

/// GET /hub
pub async fn hub_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let identity = state.gate.authenticate_viewer(&headers).await?;
    Ok(ws.on_upgrade(move |socket| handle_hub(socket, state, identity)))
}

async fn handle_hub(socket: WebSocket, state: AppState, identity: AuthIdentity) {
    let user_id = identity.user_id;
    let (mut sender, mut receiver) = socket.split();

    let (handle, mut outbound) = SocketHandle::new();
    let conn_id = handle.conn_id;
    state.registry.attach_hub(&user_id, handle.clone());

    // Initial listings.
    send_runners(&state, &user_id, &handle).await;
    send_sessions(&state, &user_id, &handle).await;

    let send_task = tokio::spawn(async move {
        while let Some(payload) = outbound.recv().await {
            if sender.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = receiver.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        match serde_json::from_str::<HubClientEvent>(&text) {
            Ok(HubClientEvent::ListRunners) => send_runners(&state, &user_id, &handle).await,
            Ok(HubClientEvent::ListSessions) => send_sessions(&state, &user_id, &handle).await,
            Ok(command) => dispatch_runner_command(&state, &user_id, &handle, command).await,
            Err(err) => debug!("dropping malformed hub event: {err}"),
        }
    }

    send_task.abort();
    state.registry.detach_hub(&user_id, conn_id);
}

async fn send_runners(state: &AppState, user_id: &str, handle: &SocketHandle) {
    let runners = state
        .store
        .runners_for_user(user_id)
        .await
        .iter()
        .map(|runner| runner.summary())
        .collect();
    handle.send_event(&HubServerEvent::Runners { runners });
}

async fn send_sessions(state: &AppState, user_id: &str, handle: &SocketHandle) {
    let sessions = state
        .store
        .sessions_for_user(user_id)
        .await
        .iter()
        .map(|session| session.summary())
        .collect();
    handle.send_event(&HubServerEvent::Sessions { sessions });
}

/// Which reply event answers a command, so failures can be correlated
/// without a runner round-trip.
enum ReplyKind {
    Skill,
    File,
}

impl ReplyKind {
    fn error(&self, id: &str, message: &str) -> HubServerEvent {
        match self {
            ReplyKind::Skill => HubServerEvent::SkillResult {
                id: id.to_string(),
                ok: false,
                skill: None,
                error: Some(message.to_string()),
            },
            ReplyKind::File => HubServerEvent::FileResult {
                id: id.to_string(),
                ok: false,
                data: None,
                error: Some(message.to_string()),
            },
        }
    }
}

/// Route a hub-originated command to the runner that owns it. A command
/// for a runner that is gone, or not this user's, answers immediately on
/// the command id.
async fn dispatch_runner_command(
    state: &AppState,
    user_id: &str,
    handle: &SocketHandle,
    command: HubClientEvent,
) {
    let Some((runner_id, id, reply, command)) = into_runner_command(command) else {
        return;
    };

    let owned = state
        .store
        .get_runner(&runner_id)
        .await
        .is_some_and(|runner| runner.user_id == user_id);
    if !owned {
        debug!("hub command {id} for unknown or foreign runner {runner_id} dropped");
        handle.send_event(&reply.error(&id, "runner not found"));
        return;
    }

    state.to_runner(&runner_id, &command).await;
}

fn into_runner_command(
    event: HubClientEvent,
) -> Option<(String, String, ReplyKind, RunnerServerEvent)> {
    use HubClientEvent as H;
    use RunnerServerEvent as R;

    Some(match event {
        // Handled directly by the hub loop.
        H::ListRunners | H::ListSessions => return None,

        H::ListRunnerSessions { runner_id, id } => {
            (runner_id, id.clone(), ReplyKind::File, R::ListSessions { id })
        }
        H::ListRunnerTerminals { runner_id, id } => {
            (runner_id, id.clone(), ReplyKind::File, R::ListTerminals { id })
        }
        H::ListSkills { runner_id, id } => {
            (runner_id, id.clone(), ReplyKind::File, R::ListSkills { id })
        }
        H::CreateSkill { runner_id, id, skill } => (
            runner_id,
            id.clone(),
            ReplyKind::Skill,
            R::CreateSkill { id, skill },
        ),
        H::UpdateSkill { runner_id, id, skill_id, skill } => (
            runner_id,
            id.clone(),
            ReplyKind::Skill,
            R::UpdateSkill { id, skill_id, skill },
        ),
        H::DeleteSkill { runner_id, id, skill_id } => (
            runner_id,
            id.clone(),
            ReplyKind::Skill,
            R::DeleteSkill { id, skill_id },
        ),
        H::GetSkill { runner_id, id, skill_id } => (
            runner_id,
            id.clone(),
            ReplyKind::Skill,
            R::GetSkill { id, skill_id },
        ),
        H::ListFiles { runner_id, id, path } => (
            runner_id,
            id.clone(),
            ReplyKind::File,
            R::ListFiles { id, path },
        ),
        H::ReadFile { runner_id, id, path } => (
            runner_id,
            id.clone(),
            ReplyKind::File,
            R::ReadFile { id, path },
        ),
        H::GitStatus { runner_id, id, cwd } => (
            runner_id,
            id.clone(),
            ReplyKind::File,
            R::GitStatus { id, cwd },
        ),
        H::GitDiff { runner_id, id, cwd, path } => (
            runner_id,
            id.clone(),
            ReplyKind::File,
            R::GitDiff { id, cwd, path },
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn listing_requests_are_not_runner_commands() {
        assert!(into_runner_command(HubClientEvent::ListRunners).is_none());
        assert!(into_runner_command(HubClientEvent::ListSessions).is_none());
    }

    #[test]
    fn commands_map_onto_the_runner_catalog() {
        let (runner_id, id, _, command) = into_runner_command(HubClientEvent::GitDiff {
            runner_id: "r-1".into(),
            id: "q-7".into(),
            cwd: "/work".into(),
            path: Some("src/main.rs".into()),
        })
        .unwrap();
        assert_eq!(runner_id, "r-1");
        assert_eq!(id, "q-7");
        match command {
            RunnerServerEvent::GitDiff { id, cwd, path } => {
                assert_eq!(id, "q-7");
                assert_eq!(cwd, "/work");
                assert_eq!(path.as_deref(), Some("src/main.rs"));
            }
            other => panic!("wrong command: {other:?}"),
        }

        let (_, _, _, command) = into_runner_command(HubClientEvent::CreateSkill {
            runner_id: "r-1".into(),
            id: "q-8".into(),
            skill: json!({"name": "review"}),
        })
        .unwrap();
        assert!(matches!(command, RunnerServerEvent::CreateSkill { .. }));
    }

    #[test]
    fn error_replies_carry_the_command_id() {
        let reply = ReplyKind::Skill.error("q-1", "runner not found");
        match reply {
            HubServerEvent::SkillResult { id, ok, error, .. } => {
                assert_eq!(id, "q-1");
                assert!(!ok);
                assert_eq!(error.as_deref(), Some("runner not found"));
            }
            other => panic!("wrong reply: {other:?}"),
        }

        let reply = ReplyKind::File.error("q-2", "runner not found");
        assert!(matches!(reply, HubServerEvent::FileResult { ok: false, .. }));
    }
}
