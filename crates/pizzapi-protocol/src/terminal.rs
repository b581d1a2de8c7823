//! `/terminal` namespace events — browser PTY clients attached to a runner
//! terminal.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminalClientEvent {
    Input { data: String },
    Resize { cols: u16, rows: u16 },
    Kill,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminalServerEvent {
    /// The PTY is spawned and accepting input.
    Ready,
    Data { data: String },
    Exit {
        #[serde(default, rename = "exitCode", skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_round_trip() {
        let json = r#"{"type":"resize","cols":120,"rows":40}"#;
        let ev: TerminalClientEvent = serde_json::from_str(json).unwrap();
        match ev {
            TerminalClientEvent::Resize { cols, rows } => {
                assert_eq!((cols, rows), (120, 40));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn exit_without_code() {
        let ev = TerminalServerEvent::Exit { exit_code: None };
        assert_eq!(serde_json::to_string(&ev).unwrap(), r#"{"type":"exit"}"#);
    }
}
