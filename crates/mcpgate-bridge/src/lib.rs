//! Bidirectional bridge between line-delimited JSON-RPC 2.0 on stdio and a
//! remote MCP server speaking HTTP POST + Server-Sent Events.
//!
//! The local process sees a single JSON-RPC channel; this crate hides the
//! dual-channel transport behind it:
//! - an SSE subscription carries server→client frames and announces the
//!   per-session POST endpoint (`sse`, `sse_client`),
//! - an HTTP POST channel carries client→server frames (`sender`),
//! - a hold-and-forward queue buffers client frames until the session is
//!   ready (`queue`),
//! - a reconnection supervisor classifies failures, rotates the session id,
//!   and replays the initialize handshake (`classify`, `supervisor`),
//! - a single event loop routes frames between all of the above (`bridge`).

mod bridge;
pub mod classify;
mod config;
pub mod jsonrpc;
mod queue;
mod sender;
pub mod sse;
mod sse_client;
mod supervisor;

pub use bridge::run;
pub use config::BridgeConfig;
pub use jsonrpc::{Frame, JsonRpcId};
pub use queue::FrameQueue;
pub use sender::{PostSender, SendError};
pub use sse_client::{SseClient, SseSignal};
pub use supervisor::{Supervisor, SupervisorState};

/// MCP protocol version replayed in the initialize handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Client identity replayed in the initialize handshake. Must match what the
/// local client sends for its own handshake, byte for byte.
pub const HANDSHAKE_CLIENT_NAME: &str = "claude-ai";
pub const HANDSHAKE_CLIENT_VERSION: &str = "0.1.0";
