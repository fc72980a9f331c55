//! Helper process internals: MCP session wrapper and the stdin/stdout IPC loop.
//!
//! One helper owns exactly one MCP client session. The bridge talks to it
//! with newline-delimited JSON frames on stdin and reads events from stdout;
//! if the connection dies, only this process dies with it.

mod launch;
mod run;
mod session;

pub use launch::{LaunchPlan, expand_tilde, resolve_launch};
pub use run::run;
pub use session::McpSession;
