//! Cross-node fan-out over the state store's pub/sub channel.
//!
//! Local delivery never rides the bus — the publishing node delivers
//! directly through its registry and skips its own frames on receive, so
//! each event is handled exactly once per node regardless of topology.

use log::{debug, warn};
use pizzapi_protocol::bus::{BusFrame, BusMessage};
use pizzapi_protocol::relay::RelayServerEvent;
use pizzapi_protocol::runner::RunnerServerEvent;
use pizzapi_protocol::viewer::ViewerServerEvent;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::registry::Registry;
use crate::store::KvBackend;

#[derive(Clone)]
pub struct RelayBus {
    backend: Arc<dyn KvBackend>,
    channel: String,
    node_id: String,
}

impl RelayBus {
    pub fn new(backend: Arc<dyn KvBackend>, channel: String) -> Self {
        Self {
            backend,
            channel,
            node_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn publish(&self, message: BusMessage) {
        let frame = BusFrame {
            origin: self.node_id.clone(),
            message,
        };
        let Ok(payload) = serde_json::to_string(&frame) else {
            return;
        };
        if let Err(err) = self.backend.publish(&self.channel, &payload).await {
            debug!("bus publish failed: {err:#}");
        }
    }

    fn to_value<T: Serialize>(event: &T) -> Option<serde_json::Value> {
        serde_json::to_value(event).ok()
    }

    /// Fan a viewer event out to the session's room members on other nodes.
    pub async fn publish_room_event(&self, session_id: &str, event: &ViewerServerEvent) {
        if let Some(payload) = Self::to_value(event) {
            self.publish(BusMessage::RoomEvent {
                session_id: session_id.to_string(),
                payload,
            })
            .await;
        }
    }

    /// Route a producer-bound event to whichever node holds the TUI socket.
    pub async fn publish_to_producer(&self, session_id: &str, event: &RelayServerEvent) {
        if let Some(payload) = Self::to_value(event) {
            self.publish(BusMessage::ToProducer {
                session_id: session_id.to_string(),
                payload,
            })
            .await;
        }
    }

    /// Route a runner command to whichever node holds the runner socket.
    pub async fn publish_to_runner(&self, runner_id: &str, event: &RunnerServerEvent) {
        if let Some(payload) = Self::to_value(event) {
            self.publish(BusMessage::ToRunner {
                runner_id: runner_id.to_string(),
                payload,
            })
            .await;
        }
    }

    /// Route an exec result back to the node holding the issuing viewer.
    pub async fn publish_exec_result(&self, session_id: &str, event: &ViewerServerEvent) {
        if let Some(payload) = Self::to_value(event) {
            self.publish(BusMessage::ExecResult {
                session_id: session_id.to_string(),
                payload,
            })
            .await;
        }
    }

    /// Attach the bus to the local registry: subscribe and deliver inbound
    /// frames until shutdown.
    pub async fn start(
        self: Arc<Self>,
        registry: Arc<Registry>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        let mut rx = self.backend.subscribe(&self.channel).await?;
        let bus = self.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    message = rx.recv() => {
                        let Some(payload) = message else {
                            warn!("bus subscription closed; cross-node delivery stopped");
                            break;
                        };
                        bus.dispatch(&registry, &payload);
                    }
                }
            }
        });
        Ok(())
    }

    fn dispatch(&self, registry: &Registry, payload: &str) {
        let frame: BusFrame = match serde_json::from_str(payload) {
            Ok(frame) => frame,
            Err(err) => {
                debug!("dropping malformed bus frame: {err}");
                return;
            }
        };
        if frame.origin == self.node_id {
            return;
        }

        match frame.message {
            BusMessage::RoomEvent { session_id, payload } => {
                registry.send_raw_to_room(&session_id, &payload.to_string());
            }
            BusMessage::ToProducer { session_id, payload } => {
                if let Some(tui) = registry.tui(&session_id) {
                    tui.send(payload.to_string());
                }
            }
            BusMessage::ToRunner { runner_id, payload } => {
                if let Some(runner) = registry.runner(&runner_id) {
                    runner.send(payload.to_string());
                }
            }
            BusMessage::ExecResult { session_id: _, payload } => {
                let Some(exec_id) = payload.get("id").and_then(|id| id.as_str()) else {
                    return;
                };
                // Only the node holding the issuing viewer has the route.
                if let Some(route) = registry.take_exec(exec_id) {
                    route.viewer.send(payload.to_string());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SocketHandle;
    use crate::store::{MemoryBackend, RelayStore, SessionData};
    use serde_json::json;
    use std::time::Duration;

    fn session(id: &str) -> SessionData {
        SessionData {
            session_id: id.into(),
            token: "tok".into(),
            cwd: "/".into(),
            share_url: String::new(),
            started_at: 0,
            user_id: "u-1".into(),
            user_name: "Ada".into(),
            session_name: None,
            collab_mode: false,
            is_active: true,
            last_heartbeat_at: None,
            last_heartbeat: None,
            last_state: None,
            runner_id: None,
            runner_name: None,
            is_ephemeral: true,
            expires_at: None,
        }
    }

    /// Two buses sharing one backend behave like two relay nodes: an event
    /// published on node A reaches a viewer joined on node B, and node A
    /// ignores its own frame.
    #[tokio::test]
    async fn cross_node_room_delivery() {
        let backend: Arc<dyn KvBackend> = Arc::new(MemoryBackend::new());
        let store = RelayStore::new(backend.clone(), None);
        store.create_session(&session("s-1")).await;

        let registry_a = Arc::new(Registry::new(store.clone()));
        let registry_b = Arc::new(Registry::new(store.clone()));

        let bus_a = Arc::new(RelayBus::new(backend.clone(), "sio:bus".into()));
        let bus_b = Arc::new(RelayBus::new(backend.clone(), "sio:bus".into()));
        let shutdown = CancellationToken::new();
        bus_a
            .clone()
            .start(registry_a.clone(), shutdown.clone())
            .await
            .unwrap();
        bus_b
            .clone()
            .start(registry_b.clone(), shutdown.clone())
            .await
            .unwrap();

        let (viewer_a, mut rx_a) = SocketHandle::new();
        let (viewer_b, mut rx_b) = SocketHandle::new();
        registry_a.join_viewer("s-1", viewer_a).await;
        registry_b.join_viewer("s-1", viewer_b).await;

        let event = ViewerServerEvent::Event {
            event: json!({"type": "text", "delta": "hi"}),
            seq: Some(1),
            replay: false,
        };
        // Node A delivers locally, then publishes for the rest.
        registry_a.send_to_room("s-1", &event);
        bus_a.publish_room_event("s-1", &event).await;

        let on_b = tokio::time::timeout(Duration::from_secs(1), rx_b.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(on_b.contains(r#""delta":"hi""#));

        // Node A's viewer got exactly the direct delivery, not a bus echo.
        let first = rx_a.try_recv().unwrap();
        assert!(first.contains(r#""delta":"hi""#));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn producer_routing_reaches_owning_node() {
        let backend: Arc<dyn KvBackend> = Arc::new(MemoryBackend::new());
        let store = RelayStore::new(backend.clone(), None);

        let registry_b = Arc::new(Registry::new(store.clone()));
        let bus_a = Arc::new(RelayBus::new(backend.clone(), "sio:bus".into()));
        let bus_b = Arc::new(RelayBus::new(backend.clone(), "sio:bus".into()));
        let shutdown = CancellationToken::new();
        bus_b
            .clone()
            .start(registry_b.clone(), shutdown.clone())
            .await
            .unwrap();

        let (tui, mut rx) = SocketHandle::new();
        registry_b.set_tui("s-1", tui);

        bus_a
            .publish_to_producer(
                "s-1",
                &RelayServerEvent::ModelSet {
                    provider: "anthropic".into(),
                    model_id: "opus".into(),
                },
            )
            .await;

        let payload = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(payload.contains(r#""type":"model_set""#));
    }
}
