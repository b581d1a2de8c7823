//! `/runner` namespace events.
//!
//! A runner daemon connects once per host, registers itself, then executes
//! session/terminal lifecycle commands and streams worker-produced agent
//! events back up. Request/response commands carry an `id`; the runner
//! answers single-skill CRUD commands with `skill_result` and every other
//! id-carrying command (listings, files, git) with `file_result`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{RunnerSkill, TerminalSpawnOpts};

// ============================================================================
// Runner -> Relay
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnerClientEvent {
    /// First message on a fresh connection.
    RegisterRunner {
        /// The id the runner wants to keep across reconnects. The relay
        /// answers with the authoritative id in `runner_registered`.
        #[serde(default, rename = "runnerId", skip_serializing_if = "Option::is_none")]
        runner_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        /// Directories this runner may spawn sessions under.
        #[serde(default)]
        roots: Vec<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        skills: Vec<RunnerSkill>,
    },

    /// Unsolicited refresh of the skill inventory.
    SkillsList { skills: Vec<RunnerSkill> },

    /// Reply to a skill command, keyed by the command `id`.
    SkillResult {
        id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        skill: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Reply to a file/listing/git command, keyed by the command `id`.
    FileResult {
        id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// An agent event produced by a worker the runner spawned. The first one
    /// for a pending session binds the session to this runner.
    RunnerSessionEvent {
        #[serde(rename = "sessionId")]
        session_id: String,
        event: Value,
    },

    /// The worker for a requested session is up.
    SessionReady {
        #[serde(rename = "sessionId")]
        session_id: String,
    },

    /// Spawning or running a session failed on the runner.
    SessionError {
        #[serde(rename = "sessionId")]
        session_id: String,
        error: String,
    },

    /// A session's worker was killed.
    SessionKilled {
        #[serde(rename = "sessionId")]
        session_id: String,
    },

    // ========== Terminals ==========
    TerminalReady {
        #[serde(rename = "terminalId")]
        terminal_id: String,
    },

    TerminalData {
        #[serde(rename = "terminalId")]
        terminal_id: String,
        data: String,
    },

    TerminalExit {
        #[serde(rename = "terminalId")]
        terminal_id: String,
        #[serde(default, rename = "exitCode", skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },

    TerminalError {
        #[serde(rename = "terminalId")]
        terminal_id: String,
        error: String,
    },
}

// ============================================================================
// Relay -> Runner
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnerServerEvent {
    /// Registration ack carrying the authoritative runner id.
    RunnerRegistered {
        #[serde(rename = "runnerId")]
        runner_id: String,
    },

    /// Spawn a worker for a session.
    NewSession {
        #[serde(rename = "sessionId")]
        session_id: String,
        cwd: String,
        #[serde(default, rename = "sessionName", skip_serializing_if = "Option::is_none")]
        session_name: Option<String>,
        /// Initial prompt to hand to the agent, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
    },

    KillSession {
        #[serde(rename = "sessionId")]
        session_id: String,
    },

    ListSessions { id: String },

    /// Restart the runner process in place.
    Restart,

    Shutdown,

    /// Liveness probe; any inbound traffic refreshes the runner TTL.
    Ping,

    // ========== Terminals ==========
    NewTerminal {
        #[serde(rename = "terminalId")]
        terminal_id: String,
        #[serde(default, rename = "spawnOpts")]
        spawn_opts: TerminalSpawnOpts,
    },

    TerminalInput {
        #[serde(rename = "terminalId")]
        terminal_id: String,
        data: String,
    },

    TerminalResize {
        #[serde(rename = "terminalId")]
        terminal_id: String,
        cols: u16,
        rows: u16,
    },

    KillTerminal {
        #[serde(rename = "terminalId")]
        terminal_id: String,
    },

    ListTerminals { id: String },

    // ========== Skills ==========
    ListSkills { id: String },

    CreateSkill { id: String, skill: Value },

    UpdateSkill {
        id: String,
        #[serde(rename = "skillId")]
        skill_id: String,
        skill: Value,
    },

    DeleteSkill {
        id: String,
        #[serde(rename = "skillId")]
        skill_id: String,
    },

    GetSkill {
        id: String,
        #[serde(rename = "skillId")]
        skill_id: String,
    },

    // ========== Files ==========
    ListFiles { id: String, path: String },

    ReadFile { id: String, path: String },

    GitStatus { id: String, cwd: String },

    GitDiff {
        id: String,
        cwd: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },

    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_runner_wire_shape() {
        let json = r#"{"type":"register_runner","runnerId":"r-1","roots":["/home/ada"],"skills":[]}"#;
        let ev: RunnerClientEvent = serde_json::from_str(json).unwrap();
        match ev {
            RunnerClientEvent::RegisterRunner { runner_id, roots, .. } => {
                assert_eq!(runner_id.as_deref(), Some("r-1"));
                assert_eq!(roots, vec!["/home/ada"]);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn register_runner_id_is_optional() {
        let json = r#"{"type":"register_runner","roots":[]}"#;
        let ev: RunnerClientEvent = serde_json::from_str(json).unwrap();
        match ev {
            RunnerClientEvent::RegisterRunner { runner_id, .. } => assert!(runner_id.is_none()),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn new_session_serializes_camel_case() {
        let ev = RunnerServerEvent::NewSession {
            session_id: "s-1".into(),
            cwd: "/work".into(),
            session_name: None,
            prompt: None,
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains(r#""type":"new_session""#));
        assert!(json.contains(r#""sessionId":"s-1""#));
        assert!(!json.contains("sessionName"));
    }

    #[test]
    fn terminal_exit_round_trip() {
        let json = r#"{"type":"terminal_exit","terminalId":"t-9","exitCode":0}"#;
        let ev: RunnerClientEvent = serde_json::from_str(json).unwrap();
        match ev {
            RunnerClientEvent::TerminalExit { terminal_id, exit_code } => {
                assert_eq!(terminal_id, "t-9");
                assert_eq!(exit_code, Some(0));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }
}
