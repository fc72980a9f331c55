//! mcpmux: a TCP-fronted multiplexer and lifecycle supervisor for MCP
//! services.
//!
//! Clients send line-delimited JSON commands over a loopback TCP socket.
//! The bridge keeps an in-memory registry of named services, runs one
//! isolated helper process per active service (the helper owns the actual
//! MCP session), routes tool calls to helpers and replies back to the
//! originating socket, and supervises the lot: spawn and request timeouts,
//! idle eviction, crash restart with backoff, graceful shutdown.

mod bridge;
mod config;
mod dispatch;
mod registry;
mod router;
mod server;
mod supervisor;

pub use config::{BridgeConfig, DEFAULT_PORT};
pub use server::{BridgeHandle, start};
