//! Entities mirrored in the state store.
//!
//! Entities live as flat string hashes so cross-node updates can touch
//! individual fields; the mapping to and from field lists is explicit here,
//! one field per line, like a repository binds its columns.

use pizzapi_protocol::{RunnerSkill, RunnerSummary, SessionSummary, TerminalSpawnOpts};
use serde_json::Value;
use std::collections::HashMap;

type Fields = Vec<(String, String)>;

fn put(fields: &mut Fields, name: &str, value: impl Into<String>) {
    fields.push((name.to_string(), value.into()));
}

fn put_opt(fields: &mut Fields, name: &str, value: Option<impl Into<String>>) {
    if let Some(value) = value {
        put(fields, name, value);
    }
}

fn put_bool(fields: &mut Fields, name: &str, value: bool) {
    put(fields, name, if value { "1" } else { "0" });
}

fn get_bool(map: &HashMap<String, String>, name: &str) -> bool {
    map.get(name).is_some_and(|v| v == "1" || v == "true")
}

fn get_i64(map: &HashMap<String, String>, name: &str) -> Option<i64> {
    map.get(name).and_then(|v| v.parse().ok())
}

fn get_json(map: &HashMap<String, String>, name: &str) -> Option<Value> {
    map.get(name).and_then(|v| serde_json::from_str(v).ok())
}

// ============================================================================
// Session
// ============================================================================

/// Live session state, owned by the producer socket.
#[derive(Debug, Clone)]
pub struct SessionData {
    pub session_id: String,
    /// Bearer secret the producer must present to (re)attach.
    pub token: String,
    pub cwd: String,
    pub share_url: String,
    /// Unix ms.
    pub started_at: i64,
    pub user_id: String,
    pub user_name: String,
    pub session_name: Option<String>,
    /// Whether viewer-originated input is forwarded to the producer.
    pub collab_mode: bool,
    pub is_active: bool,
    pub last_heartbeat_at: Option<i64>,
    pub last_heartbeat: Option<Value>,
    pub last_state: Option<Value>,
    pub runner_id: Option<String>,
    pub runner_name: Option<String>,
    pub is_ephemeral: bool,
    /// Unix ms; ephemeral sessions past this point are swept.
    pub expires_at: Option<i64>,
}

impl SessionData {
    pub fn to_fields(&self) -> Fields {
        let mut fields = Fields::new();
        put(&mut fields, "sessionId", &self.session_id);
        put(&mut fields, "token", &self.token);
        put(&mut fields, "cwd", &self.cwd);
        put(&mut fields, "shareUrl", &self.share_url);
        put(&mut fields, "startedAt", self.started_at.to_string());
        put(&mut fields, "userId", &self.user_id);
        put(&mut fields, "userName", &self.user_name);
        put_opt(&mut fields, "sessionName", self.session_name.as_deref());
        put_bool(&mut fields, "collabMode", self.collab_mode);
        put_bool(&mut fields, "isActive", self.is_active);
        put_opt(
            &mut fields,
            "lastHeartbeatAt",
            self.last_heartbeat_at.map(|v| v.to_string()),
        );
        put_opt(
            &mut fields,
            "lastHeartbeat",
            self.last_heartbeat.as_ref().map(|v| v.to_string()),
        );
        put_opt(
            &mut fields,
            "lastState",
            self.last_state.as_ref().map(|v| v.to_string()),
        );
        put_opt(&mut fields, "runnerId", self.runner_id.as_deref());
        put_opt(&mut fields, "runnerName", self.runner_name.as_deref());
        put_bool(&mut fields, "isEphemeral", self.is_ephemeral);
        put_opt(
            &mut fields,
            "expiresAt",
            self.expires_at.map(|v| v.to_string()),
        );
        fields
    }

    pub fn from_fields(map: &HashMap<String, String>) -> Option<Self> {
        Some(Self {
            session_id: map.get("sessionId")?.clone(),
            token: map.get("token")?.clone(),
            cwd: map.get("cwd").cloned().unwrap_or_default(),
            share_url: map.get("shareUrl").cloned().unwrap_or_default(),
            started_at: get_i64(map, "startedAt").unwrap_or(0),
            user_id: map.get("userId")?.clone(),
            user_name: map.get("userName").cloned().unwrap_or_default(),
            session_name: map.get("sessionName").cloned(),
            collab_mode: get_bool(map, "collabMode"),
            is_active: get_bool(map, "isActive"),
            last_heartbeat_at: get_i64(map, "lastHeartbeatAt"),
            last_heartbeat: get_json(map, "lastHeartbeat"),
            last_state: get_json(map, "lastState"),
            runner_id: map.get("runnerId").cloned(),
            runner_name: map.get("runnerName").cloned(),
            is_ephemeral: get_bool(map, "isEphemeral"),
            expires_at: get_i64(map, "expiresAt"),
        })
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id.clone(),
            session_name: self.session_name.clone(),
            user_id: self.user_id.clone(),
            cwd: self.cwd.clone(),
            is_active: self.is_active,
            is_ephemeral: self.is_ephemeral,
            started_at: self.started_at,
            runner_id: self.runner_id.clone(),
            runner_name: self.runner_name.clone(),
        }
    }
}

// ============================================================================
// Runner
// ============================================================================

#[derive(Debug, Clone)]
pub struct RunnerData {
    pub runner_id: String,
    pub user_id: String,
    pub user_name: String,
    pub name: Option<String>,
    /// Directories the runner may spawn sessions under.
    pub roots: Vec<String>,
    pub skills: Vec<RunnerSkill>,
}

impl RunnerData {
    pub fn to_fields(&self) -> Fields {
        let mut fields = Fields::new();
        put(&mut fields, "runnerId", &self.runner_id);
        put(&mut fields, "userId", &self.user_id);
        put(&mut fields, "userName", &self.user_name);
        put_opt(&mut fields, "name", self.name.as_deref());
        put(
            &mut fields,
            "roots",
            serde_json::to_string(&self.roots).unwrap_or_else(|_| "[]".into()),
        );
        put(
            &mut fields,
            "skills",
            serde_json::to_string(&self.skills).unwrap_or_else(|_| "[]".into()),
        );
        fields
    }

    pub fn from_fields(map: &HashMap<String, String>) -> Option<Self> {
        Some(Self {
            runner_id: map.get("runnerId")?.clone(),
            user_id: map.get("userId")?.clone(),
            user_name: map.get("userName").cloned().unwrap_or_default(),
            name: map.get("name").cloned(),
            roots: map
                .get("roots")
                .and_then(|v| serde_json::from_str(v).ok())
                .unwrap_or_default(),
            skills: map
                .get("skills")
                .and_then(|v| serde_json::from_str(v).ok())
                .unwrap_or_default(),
        })
    }

    /// Whether `cwd` falls under one of the runner's permitted roots.
    pub fn permits_cwd(&self, cwd: &str) -> bool {
        self.roots.iter().any(|root| {
            let root = root.trim_end_matches('/');
            cwd == root || cwd.starts_with(&format!("{root}/"))
        })
    }

    pub fn summary(&self) -> RunnerSummary {
        RunnerSummary {
            runner_id: self.runner_id.clone(),
            name: self.name.clone(),
            user_id: self.user_id.clone(),
            roots: self.roots.clone(),
            skills: self.skills.clone(),
        }
    }
}

// ============================================================================
// Terminal
// ============================================================================

#[derive(Debug, Clone)]
pub struct TerminalData {
    pub terminal_id: String,
    pub runner_id: String,
    pub user_id: String,
    pub spawned: bool,
    pub exited: bool,
    pub spawn_opts: TerminalSpawnOpts,
}

impl TerminalData {
    pub fn to_fields(&self) -> Fields {
        let mut fields = Fields::new();
        put(&mut fields, "terminalId", &self.terminal_id);
        put(&mut fields, "runnerId", &self.runner_id);
        put(&mut fields, "userId", &self.user_id);
        put_bool(&mut fields, "spawned", self.spawned);
        put_bool(&mut fields, "exited", self.exited);
        put(
            &mut fields,
            "spawnOpts",
            serde_json::to_string(&self.spawn_opts).unwrap_or_else(|_| "{}".into()),
        );
        fields
    }

    pub fn from_fields(map: &HashMap<String, String>) -> Option<Self> {
        Some(Self {
            terminal_id: map.get("terminalId")?.clone(),
            runner_id: map.get("runnerId")?.clone(),
            user_id: map.get("userId").cloned().unwrap_or_default(),
            spawned: get_bool(map, "spawned"),
            exited: get_bool(map, "exited"),
            spawn_opts: map
                .get("spawnOpts")
                .and_then(|v| serde_json::from_str(v).ok())
                .unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_session() -> SessionData {
        SessionData {
            session_id: "s-1".into(),
            token: "tok".into(),
            cwd: "/work".into(),
            share_url: "https://pi.example/s/s-1".into(),
            started_at: 1_700_000_000_000,
            user_id: "u-1".into(),
            user_name: "Ada".into(),
            session_name: Some("refactor".into()),
            collab_mode: true,
            is_active: true,
            last_heartbeat_at: Some(1_700_000_000_500),
            last_heartbeat: Some(json!({"type": "heartbeat"})),
            last_state: None,
            runner_id: None,
            runner_name: None,
            is_ephemeral: true,
            expires_at: Some(1_700_000_600_000),
        }
    }

    #[test]
    fn session_fields_round_trip() {
        let session = sample_session();
        let map: HashMap<String, String> = session.to_fields().into_iter().collect();
        let back = SessionData::from_fields(&map).unwrap();

        assert_eq!(back.session_id, session.session_id);
        assert_eq!(back.token, session.token);
        assert_eq!(back.session_name, session.session_name);
        assert!(back.collab_mode);
        assert!(back.is_active);
        assert!(back.is_ephemeral);
        assert_eq!(back.expires_at, session.expires_at);
        assert_eq!(back.last_heartbeat, session.last_heartbeat);
        assert!(back.last_state.is_none());
        assert!(back.runner_id.is_none());
    }

    #[test]
    fn session_from_fields_requires_identity() {
        let map = HashMap::from([("cwd".to_string(), "/work".to_string())]);
        assert!(SessionData::from_fields(&map).is_none());
    }

    #[test]
    fn runner_cwd_permission_checks_roots() {
        let runner = RunnerData {
            runner_id: "r-1".into(),
            user_id: "u-1".into(),
            user_name: "Ada".into(),
            name: None,
            roots: vec!["/home/ada/projects".into()],
            skills: Vec::new(),
        };

        assert!(runner.permits_cwd("/home/ada/projects"));
        assert!(runner.permits_cwd("/home/ada/projects/app"));
        assert!(!runner.permits_cwd("/home/ada"));
        assert!(!runner.permits_cwd("/home/ada/projects-other"));
    }

    #[test]
    fn terminal_fields_round_trip() {
        let terminal = TerminalData {
            terminal_id: "t-1".into(),
            runner_id: "r-1".into(),
            user_id: "u-1".into(),
            spawned: true,
            exited: false,
            spawn_opts: TerminalSpawnOpts {
                cwd: Some("/work".into()),
                cols: Some(120),
                ..Default::default()
            },
        };
        let map: HashMap<String, String> = terminal.to_fields().into_iter().collect();
        let back = TerminalData::from_fields(&map).unwrap();
        assert!(back.spawned);
        assert!(!back.exited);
        assert_eq!(back.spawn_opts.cols, Some(120));
    }
}
