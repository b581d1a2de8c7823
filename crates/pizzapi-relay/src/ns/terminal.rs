//! `/terminal` namespace — browser PTY clients.
//!
//! A client either attaches to an existing terminal by id or asks a runner
//! it owns to spawn a new one. Keystrokes route to the owning runner;
//! output and exit come back through the runner namespace.

use axum::{
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::HeaderMap,
    response::Response,
};
use futures::{SinkExt, StreamExt};
use log::{debug, info};
use nanoid::nanoid;
use pizzapi_protocol::TerminalSpawnOpts;
use pizzapi_protocol::runner::RunnerServerEvent;
use pizzapi_protocol::terminal::TerminalClientEvent;
use serde::Deserialize;

use crate::api::{ApiError, AppState};
use crate::registry::SocketHandle;
use crate::store::TerminalData;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalHandshake {
    /// Attach to an existing terminal.
    #[serde(default)]
    terminal_id: Option<String>,
    /// Or spawn a new one on this runner.
    #[serde(default)]
    runner_id: Option<String>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    shell: Option<String>,
    #[serde(default)]
    cols: Option<u16>,
    #[serde(default)]
    rows: Option<u16>,
}

/// GET /terminal
pub async fn terminal_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(handshake): Query<TerminalHandshake>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let identity = state.gate.authenticate_viewer(&headers).await?;

    let terminal = match (&handshake.terminal_id, &handshake.runner_id) {
        (Some(terminal_id), _) => {
            let terminal = state
                .store
                .get_terminal(terminal_id)
                .await
                .ok_or_else(|| ApiError::not_found("terminal not found"))?;
            if terminal.user_id != identity.user_id {
                return Err(ApiError::Unauthorized);
            }
            terminal
        }
        (None, Some(runner_id)) => {
            spawn_terminal(&state, &identity.user_id, runner_id, &handshake).await?
        }
        (None, None) => {
            return Err(ApiError::bad_request("terminalId or runnerId is required"));
        }
    };

    Ok(ws.on_upgrade(move |socket| handle_terminal(socket, state, terminal)))
}

/// Create the terminal record and ask the runner to spawn the PTY.
async fn spawn_terminal(
    state: &AppState,
    user_id: &str,
    runner_id: &str,
    handshake: &TerminalHandshake,
) -> Result<TerminalData, ApiError> {
    let runner = state
        .store
        .get_runner(runner_id)
        .await
        .ok_or_else(|| ApiError::not_found("runner not found"))?;
    if runner.user_id != user_id {
        return Err(ApiError::Unauthorized);
    }
    if let Some(cwd) = &handshake.cwd {
        if !runner.permits_cwd(cwd) {
            return Err(ApiError::forbidden("cwd is outside the runner's roots"));
        }
    }

    let spawn_opts = TerminalSpawnOpts {
        cwd: handshake.cwd.clone(),
        shell: handshake.shell.clone(),
        cols: handshake.cols,
        rows: handshake.rows,
    };
    let terminal = TerminalData {
        terminal_id: nanoid!(),
        runner_id: runner_id.to_string(),
        user_id: user_id.to_string(),
        spawned: false,
        exited: false,
        spawn_opts: spawn_opts.clone(),
    };
    state.store.put_terminal(&terminal).await;

    state
        .to_runner(
            runner_id,
            &RunnerServerEvent::NewTerminal {
                terminal_id: terminal.terminal_id.clone(),
                spawn_opts,
            },
        )
        .await;

    info!(
        "terminal {} requested on runner {runner_id}",
        terminal.terminal_id
    );
    Ok(terminal)
}

async fn handle_terminal(socket: WebSocket, state: AppState, terminal: TerminalData) {
    let terminal_id = terminal.terminal_id.clone();
    let runner_id = terminal.runner_id.clone();
    let (mut sender, mut receiver) = socket.split();

    let (handle, mut outbound) = SocketHandle::new();
    let conn_id = handle.conn_id;
    state.registry.attach_terminal(&terminal_id, handle);

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

        match serde_json::from_str::<TerminalClientEvent>(&text) {
            Ok(TerminalClientEvent::Input { data }) => {
                state
                    .to_runner(
                        &runner_id,
                        &RunnerServerEvent::TerminalInput {
                            terminal_id: terminal_id.clone(),
                            data,
                        },
                    )
                    .await;
            }
            Ok(TerminalClientEvent::Resize { cols, rows }) => {
                state
                    .to_runner(
                        &runner_id,
                        &RunnerServerEvent::TerminalResize {
                            terminal_id: terminal_id.clone(),
                            cols,
                            rows,
                        },
                    )
                    .await;
            }
            Ok(TerminalClientEvent::Kill) => {
                state
                    .to_runner(
                        &runner_id,
                        &RunnerServerEvent::KillTerminal {
                            terminal_id: terminal_id.clone(),
                        },
                    )
                    .await;
                state.store.delete_terminal(&terminal_id, &runner_id).await;
            }
            Err(err) => {
                debug!("dropping malformed terminal event on {terminal_id}: {err}");
            }
        }
    }

    send_task.abort();
    state.registry.detach_terminal(&terminal_id, conn_id);
}
