//! Error types for the wire layer.

use thiserror::Error;

/// Errors from the wire layer (framing, handshake, protocol socket).
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },
    #[error("Malformed multipart message: {0}")]
    Malformed(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// A violation of the VIP frame-ordering rules.
///
/// Raised by [`crate::VipSocket`]; the socket must be reset with
/// `reset_send`/`reset_recv` before it is used again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("expected at least {expected} frames, got {actual}")]
    Incomplete { expected: usize, actual: usize },
    #[error("invalid subsystem: {0:?}")]
    InvalidSubsystem(String),
    #[error("invalid protocol signature: {0:?}")]
    InvalidSignature(String),
    #[error("previous send operation is not complete")]
    SendInProgress,
    #[error("previous recv operation is not complete")]
    RecvInProgress,
    #[error("missing 'via' frame required by ROUTER sockets")]
    MissingVia,
}
