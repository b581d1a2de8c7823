//! `/relay` namespace events — the producer (TUI/agent) side of a session.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{ExecRequest, ExecResult, InputPayload};

// ============================================================================
// Producer -> Relay
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayClientEvent {
    /// Periodic liveness payload, fanned out to viewers unchanged.
    Heartbeat { payload: Value },

    /// An agent event to sequence, cache and fan out.
    AgentEvent { event: Value },

    /// Full session-state replacement, fanned out as a `session_active` event.
    StateUpdate { state: Value },

    /// Result of a viewer-issued exec, routed back by `id`.
    ExecResult(ExecResult),
}

// ============================================================================
// Relay -> Producer
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayServerEvent {
    /// Handshake ack carrying the canonical session id.
    SessionRegistered {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(default, rename = "shareUrl", skip_serializing_if = "Option::is_none")]
        share_url: Option<String>,
        /// True when the producer re-attached to an existing session.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        resumed: bool,
    },

    /// Collab-mode viewer input.
    Input(InputPayload),

    /// Collab-mode model switch.
    ModelSet {
        provider: String,
        #[serde(rename = "modelId")]
        model_id: String,
    },

    /// Collab-mode remote command.
    Exec(ExecRequest),

    /// A viewer greeted the session; the TUI may push capability info.
    ViewerConnected,

    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_event_payload_is_opaque() {
        let json = r#"{"type":"agent_event","event":{"type":"text","delta":"hi"}}"#;
        let ev: RelayClientEvent = serde_json::from_str(json).unwrap();
        match ev {
            RelayClientEvent::AgentEvent { event } => {
                assert_eq!(event["type"], "text");
                assert_eq!(event["delta"], "hi");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn exec_result_routes_by_id() {
        let json = r#"{"type":"exec_result","id":"x1","stdout":"ok","exitCode":0}"#;
        let ev: RelayClientEvent = serde_json::from_str(json).unwrap();
        match ev {
            RelayClientEvent::ExecResult(res) => {
                assert_eq!(res.id, "x1");
                assert_eq!(res.extra.get("stdout").unwrap(), "ok");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn session_registered_omits_resumed_when_false() {
        let ev = RelayServerEvent::SessionRegistered {
            session_id: "s-1".into(),
            share_url: None,
            resumed: false,
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(!json.contains("resumed"));
    }
}
