//! `/hub` namespace events — a per-user dashboard socket.
//!
//! Besides the runner and session listings, the hub is where runner
//! commands originate: skill CRUD, file reads and git queries carry an `id`
//! and are answered by the matching `skill_result`/`file_result` once the
//! runner replies.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{RunnerSummary, SessionSummary};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubClientEvent {
    /// The user's registered runners.
    ListRunners,

    /// The user's relay sessions.
    ListSessions,

    /// Sessions the runner's workers hold locally. Answered by
    /// `file_result`.
    ListRunnerSessions {
        #[serde(rename = "runnerId")]
        runner_id: String,
        id: String,
    },

    /// Terminals the runner manages. Answered by `file_result`.
    ListRunnerTerminals {
        #[serde(rename = "runnerId")]
        runner_id: String,
        id: String,
    },

    // ========== Skills ==========
    /// Answered by `file_result` carrying the skill inventory.
    ListSkills {
        #[serde(rename = "runnerId")]
        runner_id: String,
        id: String,
    },

    /// Answered by `skill_result`.
    CreateSkill {
        #[serde(rename = "runnerId")]
        runner_id: String,
        id: String,
        skill: Value,
    },

    /// Answered by `skill_result`.
    UpdateSkill {
        #[serde(rename = "runnerId")]
        runner_id: String,
        id: String,
        #[serde(rename = "skillId")]
        skill_id: String,
        skill: Value,
    },

    /// Answered by `skill_result`.
    DeleteSkill {
        #[serde(rename = "runnerId")]
        runner_id: String,
        id: String,
        #[serde(rename = "skillId")]
        skill_id: String,
    },

    /// Answered by `skill_result`.
    GetSkill {
        #[serde(rename = "runnerId")]
        runner_id: String,
        id: String,
        #[serde(rename = "skillId")]
        skill_id: String,
    },

    // ========== Files / git ==========
    /// Answered by `file_result`.
    ListFiles {
        #[serde(rename = "runnerId")]
        runner_id: String,
        id: String,
        path: String,
    },

    /// Answered by `file_result`.
    ReadFile {
        #[serde(rename = "runnerId")]
        runner_id: String,
        id: String,
        path: String,
    },

    /// Answered by `file_result`.
    GitStatus {
        #[serde(rename = "runnerId")]
        runner_id: String,
        id: String,
        cwd: String,
    },

    /// Answered by `file_result`.
    GitDiff {
        #[serde(rename = "runnerId")]
        runner_id: String,
        id: String,
        cwd: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubServerEvent {
    Runners { runners: Vec<RunnerSummary> },
    Sessions { sessions: Vec<SessionSummary> },
    RunnerConnected {
        #[serde(rename = "runnerId")]
        runner_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    RunnerDisconnected {
        #[serde(rename = "runnerId")]
        runner_id: String,
    },
    SessionStarted {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    SessionEnded {
        #[serde(rename = "sessionId")]
        session_id: String,
    },

    /// Reply to a skill command, keyed by the command `id`.
    SkillResult {
        id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        skill: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Reply to a listing/file/git command, keyed by the command `id`.
    FileResult {
        id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hub_request_parses() {
        let ev: HubClientEvent = serde_json::from_str(r#"{"type":"list_runners"}"#).unwrap();
        assert!(matches!(ev, HubClientEvent::ListRunners));
    }

    #[test]
    fn runner_command_wire_shape() {
        let json = r#"{"type":"git_diff","runnerId":"r-1","id":"q-7","cwd":"/work"}"#;
        let ev: HubClientEvent = serde_json::from_str(json).unwrap();
        match ev {
            HubClientEvent::GitDiff { runner_id, id, cwd, path } => {
                assert_eq!(runner_id, "r-1");
                assert_eq!(id, "q-7");
                assert_eq!(cwd, "/work");
                assert!(path.is_none());
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn skill_command_round_trip() {
        let ev = HubClientEvent::UpdateSkill {
            runner_id: "r-1".into(),
            id: "q-1".into(),
            skill_id: "sk-1".into(),
            skill: json!({"name": "review"}),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "update_skill");
        assert_eq!(json["runnerId"], "r-1");
        assert_eq!(json["skillId"], "sk-1");
    }

    #[test]
    fn file_result_reply_shape() {
        let ev = HubServerEvent::FileResult {
            id: "q-7".into(),
            ok: false,
            data: None,
            error: Some("runner not found".into()),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "file_result");
        assert_eq!(json["id"], "q-7");
        assert_eq!(json["ok"], false);
        assert!(json.get("data").is_none());
    }
}
