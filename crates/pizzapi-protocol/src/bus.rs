//! Cross-node bus frames.
//!
//! Every frame is stamped with the publishing node's id; nodes deliver their
//! own emissions directly through the local registry and ignore frames they
//! originated, so a message is handled exactly once per node.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A frame published on the shared pub/sub channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusFrame {
    /// Id of the node that published this frame.
    pub origin: String,
    #[serde(flatten)]
    pub message: BusMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMessage {
    /// Deliver a serialized viewer event to every local member of a
    /// session's room.
    RoomEvent {
        #[serde(rename = "sessionId")]
        session_id: String,
        payload: Value,
    },

    /// Deliver a serialized producer event to the node holding the
    /// session's TUI socket.
    ToProducer {
        #[serde(rename = "sessionId")]
        session_id: String,
        payload: Value,
    },

    /// Deliver a serialized runner command to the node holding the runner
    /// socket.
    ToRunner {
        #[serde(rename = "runnerId")]
        runner_id: String,
        payload: Value,
    },

    /// Deliver an exec result to the node where the issuing viewer lives.
    /// The payload carries the exec `id` the receiving node routes by.
    ExecResult {
        #[serde(rename = "sessionId")]
        session_id: String,
        payload: Value,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frame_flattens_message() {
        let frame = BusFrame {
            origin: "node-a".into(),
            message: BusMessage::RoomEvent {
                session_id: "s-1".into(),
                payload: json!({"type": "event", "seq": 3}),
            },
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["origin"], "node-a");
        assert_eq!(json["type"], "room_event");
        assert_eq!(json["sessionId"], "s-1");

        let back: BusFrame = serde_json::from_value(json).unwrap();
        assert!(matches!(back.message, BusMessage::RoomEvent { .. }));
    }
}
