//! Process-local registry of live sockets.
//!
//! Pure lookup: entries are inserted on connect and removed on disconnect by
//! the owning connection task, never by anyone else, so no locking beyond
//! the map itself is needed. Anything that spans nodes (session existence,
//! duplicate producers, link resolution) goes through the state store
//! instead.

use dashmap::DashMap;
use log::{debug, warn};
use pizzapi_protocol::viewer::ViewerServerEvent;
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

use crate::store::RelayStore;

/// Outbound buffer per socket. A viewer that cannot drain this many
/// serialized events is disconnected and must reconnect with replay.
const SOCKET_BUFFER: usize = 64;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// A live socket's outbound channel. Messages are pre-serialized JSON.
#[derive(Debug, Clone)]
pub struct SocketHandle {
    pub conn_id: u64,
    tx: mpsc::Sender<String>,
}

impl SocketHandle {
    /// Create a handle plus the receiver its connection task drains.
    pub fn new() -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(SOCKET_BUFFER);
        (
            Self {
                conn_id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
                tx,
            },
            rx,
        )
    }

    /// Non-blocking send. Returns false when the peer is gone or too slow.
    pub fn send(&self, payload: String) -> bool {
        self.tx.try_send(payload).is_ok()
    }

    pub fn send_event<T: Serialize>(&self, event: &T) -> bool {
        match serde_json::to_string(event) {
            Ok(payload) => self.send(payload),
            Err(err) => {
                warn!("failed to serialize outbound event: {err}");
                false
            }
        }
    }
}

/// Routing slip for an in-flight exec: which viewer issued it.
#[derive(Debug, Clone)]
pub struct ExecRoute {
    pub session_id: String,
    pub viewer: SocketHandle,
}

pub struct Registry {
    store: RelayStore,
    /// session id -> producer TUI socket on this node.
    tuis: DashMap<String, SocketHandle>,
    /// runner id -> runner socket on this node.
    runners: DashMap<String, SocketHandle>,
    /// session id -> viewers in the room on this node.
    rooms: DashMap<String, Vec<SocketHandle>>,
    /// terminal id -> attached terminal clients on this node.
    terminals: DashMap<String, Vec<SocketHandle>>,
    /// user id -> hub dashboard sockets on this node.
    hubs: DashMap<String, Vec<SocketHandle>>,
    /// exec id -> issuing viewer.
    pending_execs: DashMap<String, ExecRoute>,
}

impl Registry {
    pub fn new(store: RelayStore) -> Self {
        Self {
            store,
            tuis: DashMap::new(),
            runners: DashMap::new(),
            rooms: DashMap::new(),
            terminals: DashMap::new(),
            hubs: DashMap::new(),
            pending_execs: DashMap::new(),
        }
    }

    // ========================================================================
    // Producer (TUI) sockets
    // ========================================================================

    pub fn set_tui(&self, session_id: &str, handle: SocketHandle) {
        self.tuis.insert(session_id.to_string(), handle);
    }

    pub fn tui(&self, session_id: &str) -> Option<SocketHandle> {
        self.tuis.get(session_id).map(|h| h.clone())
    }

    pub fn has_local_tui(&self, session_id: &str) -> bool {
        self.tuis.contains_key(session_id)
    }

    /// Remove the producer entry, but only if it still belongs to this
    /// connection (a reconnect may have replaced it).
    pub fn remove_tui(&self, session_id: &str, conn_id: u64) {
        self.tuis
            .remove_if(session_id, |_, handle| handle.conn_id == conn_id);
    }

    // ========================================================================
    // Runner sockets
    // ========================================================================

    pub fn set_runner(&self, runner_id: &str, handle: SocketHandle) {
        self.runners.insert(runner_id.to_string(), handle);
    }

    pub fn runner(&self, runner_id: &str) -> Option<SocketHandle> {
        self.runners.get(runner_id).map(|h| h.clone())
    }

    pub fn remove_runner(&self, runner_id: &str, conn_id: u64) {
        self.runners
            .remove_if(runner_id, |_, handle| handle.conn_id == conn_id);
    }

    // ========================================================================
    // Viewer rooms
    // ========================================================================

    /// Place a viewer into a session's room after verifying the session
    /// still exists in the state store. Returns false if the session is
    /// gone.
    pub async fn join_viewer(&self, session_id: &str, handle: SocketHandle) -> bool {
        if self.store.get_session(session_id).await.is_none() {
            return false;
        }
        self.rooms
            .entry(session_id.to_string())
            .or_default()
            .push(handle);
        true
    }

    pub fn leave_viewer(&self, session_id: &str, conn_id: u64) {
        if let Some(mut room) = self.rooms.get_mut(session_id) {
            room.retain(|handle| handle.conn_id != conn_id);
        }
        self.rooms.remove_if(session_id, |_, room| room.is_empty());
        self.pending_execs
            .retain(|_, route| route.viewer.conn_id != conn_id);
    }

    pub fn room_size(&self, session_id: &str) -> usize {
        self.rooms.get(session_id).map(|r| r.len()).unwrap_or(0)
    }

    /// Deliver an event to every local member of the session's room. Slow
    /// viewers are dropped from the room; their connection task closes the
    /// socket once the handle is gone.
    pub fn send_to_room(&self, session_id: &str, event: &ViewerServerEvent) {
        let Ok(payload) = serde_json::to_string(event) else {
            return;
        };
        self.send_raw_to_room(session_id, &payload);
    }

    pub fn send_raw_to_room(&self, session_id: &str, payload: &str) {
        let Some(mut room) = self.rooms.get_mut(session_id) else {
            return;
        };
        room.retain(|handle| {
            let delivered = handle.send(payload.to_string());
            if !delivered {
                debug!("dropping slow or closed viewer from session {session_id}");
            }
            delivered
        });
    }

    /// Send the latest known state to one viewer: the `connected` ack, then
    /// the last heartbeat and last state as plain events, when present.
    pub async fn send_snapshot_to_viewer(&self, session_id: &str, viewer: &SocketHandle) -> bool {
        let Some(session) = self.store.get_session(session_id).await else {
            return false;
        };
        let last_seq = self.store.last_seq(session_id).await;

        viewer.send_event(&ViewerServerEvent::Connected {
            session_id: session_id.to_string(),
            last_seq,
            is_active: session.is_active,
            last_heartbeat_at: session.last_heartbeat_at,
            session_name: session.session_name.clone(),
            replay_only: false,
        });

        if let Some(heartbeat) = &session.last_heartbeat {
            viewer.send_event(&ViewerServerEvent::Event {
                event: heartbeat.clone(),
                seq: None,
                replay: false,
            });
        }
        if let Some(state) = &session.last_state {
            viewer.send_event(&ViewerServerEvent::Event {
                event: json!({"type": "session_active", "state": state}),
                seq: None,
                replay: false,
            });
        }
        true
    }

    // ========================================================================
    // Exec routing
    // ========================================================================

    pub fn register_exec(&self, exec_id: &str, session_id: &str, viewer: SocketHandle) {
        self.pending_execs.insert(
            exec_id.to_string(),
            ExecRoute {
                session_id: session_id.to_string(),
                viewer,
            },
        );
    }

    pub fn take_exec(&self, exec_id: &str) -> Option<ExecRoute> {
        self.pending_execs.remove(exec_id).map(|(_, route)| route)
    }

    // ========================================================================
    // Terminal clients
    // ========================================================================

    pub fn attach_terminal(&self, terminal_id: &str, handle: SocketHandle) {
        self.terminals
            .entry(terminal_id.to_string())
            .or_default()
            .push(handle);
    }

    pub fn detach_terminal(&self, terminal_id: &str, conn_id: u64) {
        if let Some(mut clients) = self.terminals.get_mut(terminal_id) {
            clients.retain(|handle| handle.conn_id != conn_id);
        }
        self.terminals
            .remove_if(terminal_id, |_, clients| clients.is_empty());
    }

    pub fn send_to_terminal_clients<T: Serialize>(&self, terminal_id: &str, event: &T) {
        let Ok(payload) = serde_json::to_string(event) else {
            return;
        };
        if let Some(mut clients) = self.terminals.get_mut(terminal_id) {
            clients.retain(|handle| handle.send(payload.clone()));
        }
    }

    // ========================================================================
    // Hub sockets
    // ========================================================================

    pub fn attach_hub(&self, user_id: &str, handle: SocketHandle) {
        self.hubs
            .entry(user_id.to_string())
            .or_default()
            .push(handle);
    }

    pub fn detach_hub(&self, user_id: &str, conn_id: u64) {
        if let Some(mut sockets) = self.hubs.get_mut(user_id) {
            sockets.retain(|handle| handle.conn_id != conn_id);
        }
        self.hubs.remove_if(user_id, |_, sockets| sockets.is_empty());
    }

    pub fn send_to_user_hubs<T: Serialize>(&self, user_id: &str, event: &T) {
        let Ok(payload) = serde_json::to_string(event) else {
            return;
        };
        if let Some(mut sockets) = self.hubs.get_mut(user_id) {
            sockets.retain(|handle| handle.send(payload.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryBackend, SessionData};
    use std::sync::Arc;

    fn test_store() -> RelayStore {
        RelayStore::new(Arc::new(MemoryBackend::new()), None)
    }

    fn session(id: &str) -> SessionData {
        SessionData {
            session_id: id.into(),
            token: "tok".into(),
            cwd: "/".into(),
            share_url: String::new(),
            started_at: 0,
            user_id: "u-1".into(),
            user_name: "Ada".into(),
            session_name: Some("demo".into()),
            collab_mode: false,
            is_active: true,
            last_heartbeat_at: Some(42),
            last_heartbeat: Some(json!({"type": "heartbeat"})),
            last_state: Some(json!({"open": true})),
            runner_id: None,
            runner_name: None,
            is_ephemeral: true,
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn join_requires_live_session() {
        let store = test_store();
        let registry = Registry::new(store.clone());
        let (handle, _rx) = SocketHandle::new();

        assert!(!registry.join_viewer("ghost", handle.clone()).await);

        store.create_session(&session("s-1")).await;
        assert!(registry.join_viewer("s-1", handle).await);
        assert_eq!(registry.room_size("s-1"), 1);
    }

    #[tokio::test]
    async fn leave_viewer_clears_room_and_execs() {
        let store = test_store();
        store.create_session(&session("s-1")).await;
        let registry = Registry::new(store);

        let (handle, _rx) = SocketHandle::new();
        assert!(registry.join_viewer("s-1", handle.clone()).await);
        registry.register_exec("x-1", "s-1", handle.clone());

        registry.leave_viewer("s-1", handle.conn_id);
        assert_eq!(registry.room_size("s-1"), 0);
        assert!(registry.take_exec("x-1").is_none());
    }

    #[tokio::test]
    async fn room_fanout_reaches_every_member() {
        let store = test_store();
        store.create_session(&session("s-1")).await;
        let registry = Registry::new(store);

        let (a, mut rx_a) = SocketHandle::new();
        let (b, mut rx_b) = SocketHandle::new();
        registry.join_viewer("s-1", a).await;
        registry.join_viewer("s-1", b).await;

        registry.send_to_room(
            "s-1",
            &ViewerServerEvent::Event {
                event: json!({"type": "text", "delta": "hi"}),
                seq: Some(1),
                replay: false,
            },
        );

        for rx in [&mut rx_a, &mut rx_b] {
            let payload = rx.try_recv().unwrap();
            assert!(payload.contains(r#""seq":1"#));
        }
    }

    #[tokio::test]
    async fn snapshot_sends_connected_then_state() {
        let store = test_store();
        store.create_session(&session("s-1")).await;
        store.increment_seq("s-1").await;
        let registry = Registry::new(store);

        let (viewer, mut rx) = SocketHandle::new();
        assert!(registry.send_snapshot_to_viewer("s-1", &viewer).await);

        let connected = rx.try_recv().unwrap();
        assert!(connected.contains(r#""type":"connected""#));
        assert!(connected.contains(r#""lastSeq":1"#));
        assert!(connected.contains(r#""sessionName":"demo""#));

        let heartbeat = rx.try_recv().unwrap();
        assert!(heartbeat.contains(r#""type":"heartbeat""#));

        let state = rx.try_recv().unwrap();
        assert!(state.contains(r#""type":"session_active""#));
        assert!(state.contains(r#""open":true"#));
    }

    #[tokio::test]
    async fn stale_tui_entry_is_not_removed_by_old_conn() {
        let store = test_store();
        let registry = Registry::new(store);

        let (old, _rx1) = SocketHandle::new();
        let (new, _rx2) = SocketHandle::new();
        registry.set_tui("s-1", old.clone());
        registry.set_tui("s-1", new.clone());

        registry.remove_tui("s-1", old.conn_id);
        assert!(registry.has_local_tui("s-1"));

        registry.remove_tui("s-1", new.conn_id);
        assert!(!registry.has_local_tui("s-1"));
    }
}
