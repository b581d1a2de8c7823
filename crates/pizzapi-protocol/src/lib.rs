//! Wire protocol types for PizzaPi relay communication.
//!
//! The relay multiplexes several long-lived socket namespaces over one port:
//!
//! ```text
//! Runner daemon <--[/runner]--> Relay <--[/viewer, /terminal, /hub]--> Browser
//!                                 ^
//!                                 |
//!                            [/relay] TUI/agent (producer)
//! ```
//!
//! Every message is a JSON object tagged by a snake_case `type` field; payload
//! fields are camelCase to stay bit-compatible with the existing CLI and web
//! clients. Agent events themselves are opaque to the relay — they travel as
//! raw `serde_json::Value` and only gain a relay-assigned `seq` (and a
//! `replay` marker when re-sent).

pub mod bus;
pub mod hub;
pub mod relay;
pub mod runner;
pub mod terminal;
pub mod viewer;

mod types;

pub use types::{
    ExecRequest, ExecResult, InputAttachment, InputPayload, RunnerSkill, SessionSummary,
    RunnerSummary, TerminalSpawnOpts,
};
