//! Failure taxonomy driving the supervisor's reconnect policy.

use crate::jsonrpc::codes;
use crate::sender::SendError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The remote no longer recognizes our session; reconnect, and rotate
    /// the session id once retries with the original one keep failing.
    SessionLost,
    /// The transport is gone; reconnect with backoff.
    ConnectionLost,
    /// A client-observed request timeout; escalated to `ConnectionLost`
    /// after three in a row.
    Timeout,
    /// Malformed JSON on either channel; surfaced, never reconnects.
    Parse,
    /// Rejected request shape; surfaced, never reconnects.
    InvalidRequest,
    /// Any other sender failure; requeue the frame and reconnect.
    Transient,
    Internal,
}

const SESSION_LOST_MARKERS: &[&str] = &[
    "Could not find session",
    "Session expired",
    "Invalid session",
    "Received request before initialization was complete",
];

const CONNECTION_LOST_MARKERS: &[&str] = &[
    "Connection lost",
    "fetch failed",
    "network error",
    "ECONNREFUSED",
    "Not connected",
];

/// Classify a failure by its message text. The substrings match what MCP
/// servers and HTTP stacks actually produce on the wire.
pub fn classify_message(message: &str) -> ErrorKind {
    if SESSION_LOST_MARKERS.iter().any(|m| message.contains(m)) {
        return ErrorKind::SessionLost;
    }
    if CONNECTION_LOST_MARKERS.iter().any(|m| message.contains(m)) {
        return ErrorKind::ConnectionLost;
    }
    if message.contains("timed out") || message.contains("timeout") {
        return ErrorKind::Timeout;
    }
    if message.to_ascii_lowercase().contains("invalid request") {
        return ErrorKind::InvalidRequest;
    }
    ErrorKind::Transient
}

/// Classify a POST failure. 404 is how the remote signals a dead session;
/// transport errors mean the connection is gone; anything else is retried
/// through a reconnect without special handling.
pub fn classify_send_error(err: &SendError) -> ErrorKind {
    match err {
        SendError::Network(_) => ErrorKind::ConnectionLost,
        SendError::Status { status: 404, .. } => ErrorKind::SessionLost,
        SendError::Status { .. } => ErrorKind::Transient,
    }
}

/// JSON-RPC error code used when surfacing a failure of this kind.
pub fn jsonrpc_code(kind: ErrorKind) -> i64 {
    match kind {
        ErrorKind::SessionLost => codes::METHOD_NOT_FOUND,
        ErrorKind::ConnectionLost => codes::CONNECTION_CLOSED,
        ErrorKind::Timeout => codes::REQUEST_TIMEOUT,
        ErrorKind::Parse => codes::PARSE_ERROR,
        ErrorKind::InvalidRequest => codes::INVALID_REQUEST,
        ErrorKind::Transient | ErrorKind::Internal => codes::INTERNAL_ERROR,
    }
}
