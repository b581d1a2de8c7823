//! `/viewer` namespace events — browsers subscribed to a session.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{ExecRequest, ExecResult, InputPayload};

// ============================================================================
// Viewer -> Relay
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewerClientEvent {
    /// Greeting after the client finished its own setup; forwarded to the
    /// local TUI so it can push capabilities.
    Connected,

    /// Ask the relay to re-send the latest snapshot.
    Resync,

    /// Collab-mode input for the producer.
    Input(InputPayload),

    /// Collab-mode model switch.
    ModelSet {
        provider: String,
        #[serde(rename = "modelId")]
        model_id: String,
    },

    /// Collab-mode remote command; the result comes back as `exec_result`.
    Exec(ExecRequest),
}

// ============================================================================
// Relay -> Viewer
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewerServerEvent {
    /// Join ack. `replay_only` marks a dead session being replayed from its
    /// snapshot; such a connection is closed right after the replay.
    #[serde(rename_all = "camelCase")]
    Connected {
        session_id: String,
        #[serde(default)]
        last_seq: u64,
        #[serde(default)]
        is_active: bool,
        /// Unix ms of the producer's last heartbeat.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_heartbeat_at: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_name: Option<String>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        replay_only: bool,
    },

    /// A session event. `seq` is present for producer-published events and
    /// absent for synthesized ones (heartbeat/snapshot re-sends).
    Event {
        event: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        replay: bool,
    },

    /// The producer went away (or the replay finished).
    Disconnected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Result of an exec this viewer issued.
    ExecResult(ExecResult),

    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn connected_ack_wire_shape() {
        let ev = ViewerServerEvent::Connected {
            session_id: "s-1".into(),
            last_seq: 41,
            is_active: true,
            last_heartbeat_at: Some(1_700_000_000_000),
            session_name: None,
            replay_only: false,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "connected");
        assert_eq!(json["sessionId"], "s-1");
        assert_eq!(json["lastSeq"], 41);
        assert_eq!(json["isActive"], true);
        assert!(json.get("replayOnly").is_none());
    }

    #[test]
    fn replay_only_marker_is_emitted() {
        let ev = ViewerServerEvent::Connected {
            session_id: "s-1".into(),
            last_seq: 0,
            is_active: false,
            last_heartbeat_at: None,
            session_name: None,
            replay_only: true,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["replayOnly"], true);
    }

    #[test]
    fn event_envelope_carries_seq_and_replay() {
        let ev = ViewerServerEvent::Event {
            event: json!({"type": "text", "delta": "hi"}),
            seq: Some(1),
            replay: false,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["seq"], 1);
        assert_eq!(json["event"]["delta"], "hi");
        assert!(json.get("replay").is_none());

        let replayed = ViewerServerEvent::Event {
            event: json!({"type": "agent_end", "messages": []}),
            seq: None,
            replay: true,
        };
        let json = serde_json::to_value(&replayed).unwrap();
        assert_eq!(json["replay"], true);
        assert!(json.get("seq").is_none());
    }
}
