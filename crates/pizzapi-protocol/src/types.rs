//! Payload structs shared by more than one namespace.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A skill installed on a runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerSkill {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Path of the skill bundle on the runner host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Options a runner uses when spawning a PTY.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalSpawnOpts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cols: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<u16>,
}

/// An attachment reference carried on viewer input.
///
/// Only references are forwarded; the relay never inlines file bytes into the
/// socket stream. A reference must carry an `attachmentId` (relay-hosted) or
/// a `url` — anything else is dropped during sanitization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputAttachment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl InputAttachment {
    /// Whether this reference can actually be resolved by the producer.
    pub fn is_addressable(&self) -> bool {
        self.attachment_id.is_some() || self.url.is_some()
    }
}

/// Viewer-originated input forwarded to a session's producer in collab mode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputPayload {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<InputAttachment>,
    /// Identifies the client flavor that produced the input (e.g. "web").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deliver_as: Option<String>,
    /// Display name of the viewer, attached by the relay before forwarding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
}

/// A remote command issued by a viewer, correlated to its result by `id`.
///
/// Fields beyond `id` and `command` pass through untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRequest {
    pub id: String,
    pub command: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Result of an [`ExecRequest`], produced by the TUI and routed back to the
/// issuing viewer. Everything beyond `id` is opaque.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResult {
    pub id: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Session listing entry emitted on the hub namespace and the HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,
    pub user_id: String,
    pub cwd: String,
    pub is_active: bool,
    pub is_ephemeral: bool,
    /// Unix ms.
    pub started_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner_name: Option<String>,
}

/// Runner listing entry emitted on the hub namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerSummary {
    pub runner_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub user_id: String,
    pub roots: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skills: Vec<RunnerSkill>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachment_addressability() {
        let by_id = InputAttachment {
            attachment_id: Some("att-1".into()),
            ..Default::default()
        };
        assert!(by_id.is_addressable());

        let by_url = InputAttachment {
            url: Some("https://example.com/f.png".into()),
            ..Default::default()
        };
        assert!(by_url.is_addressable());

        let bare = InputAttachment {
            filename: Some("f.png".into()),
            ..Default::default()
        };
        assert!(!bare.is_addressable());
    }

    #[test]
    fn exec_request_round_trips_extra_fields() {
        let json = r#"{"id":"x1","command":"git status","timeoutMs":5000}"#;
        let req: ExecRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.id, "x1");
        assert_eq!(req.extra.get("timeoutMs").unwrap(), 5000);

        let out = serde_json::to_value(&req).unwrap();
        assert_eq!(out.get("timeoutMs").unwrap(), 5000);
    }

    #[test]
    fn input_payload_field_names_are_camel_case() {
        let input = InputPayload {
            text: "hi".into(),
            deliver_as: Some("user".into()),
            user_name: Some("Ada".into()),
            ..Default::default()
        };
        let json = serde_json::to_string(&input).unwrap();
        assert!(json.contains("deliverAs"));
        assert!(json.contains("userName"));
        assert!(!json.contains("attachments"));
    }
}
