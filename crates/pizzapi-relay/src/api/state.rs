//! Application state shared across handlers and namespaces.

use std::sync::Arc;

use pizzapi_protocol::relay::RelayServerEvent;
use pizzapi_protocol::runner::RunnerServerEvent;
use pizzapi_protocol::viewer::ViewerServerEvent;

use crate::attachments::AttachmentStore;
use crate::auth::AuthGate;
use crate::bus::RelayBus;
use crate::events::EventCache;
use crate::persist::SessionArchive;
use crate::push::PushNotifier;
use crate::registry::Registry;
use crate::settings::RelaySettings;
use crate::store::RelayStore;

/// Everything a namespace or HTTP handler needs, constructor-injected.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<RelaySettings>,
    pub store: RelayStore,
    pub events: EventCache,
    pub archive: SessionArchive,
    pub registry: Arc<Registry>,
    pub bus: Arc<RelayBus>,
    pub gate: Arc<AuthGate>,
    pub push: PushNotifier,
    pub attachments: AttachmentStore,
}

impl AppState {
    /// Deliver a viewer event to the session's room on this node and every
    /// other node.
    pub async fn fan_out(&self, session_id: &str, event: &ViewerServerEvent) {
        self.registry.send_to_room(session_id, event);
        self.bus.publish_room_event(session_id, event).await;
    }

    /// Deliver an event to the session's producer: the local TUI socket if
    /// it lives here, the bus otherwise.
    pub async fn to_producer(&self, session_id: &str, event: &RelayServerEvent) {
        if let Some(tui) = self.registry.tui(session_id) {
            tui.send_event(event);
        } else {
            self.bus.publish_to_producer(session_id, event).await;
        }
    }

    /// Deliver a command to a runner: local socket if it lives here, the
    /// bus otherwise.
    pub async fn to_runner(&self, runner_id: &str, event: &RunnerServerEvent) {
        if let Some(runner) = self.registry.runner(runner_id) {
            runner.send_event(event);
        } else {
            self.bus.publish_to_runner(runner_id, event).await;
        }
    }
}
