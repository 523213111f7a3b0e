//! Router error types.

use thiserror::Error;
use vipbus_wire::{ErrorCode, WireError};

/// Router error type.
#[derive(Error, Debug)]
pub enum RouterError {
    /// A wrapped wire-layer error.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The router could not bind its listening transport.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Broker error: {0}")]
    Broker(#[from] crate::transport::broker::BrokerError),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Unknown platform: {0}")]
    UnknownPlatform(String),

    /// The router loop has exited.
    #[error("Router stopped")]
    Stopped,
}

/// Alias for router results.
pub type RouterResult<T> = Result<T, RouterError>;

/// Why a transport could not hand frames to a peer.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// No such destination.
    #[error("peer unreachable")]
    Unreachable,
    /// The destination exists but cannot accept more messages right now.
    #[error("peer temporarily unavailable")]
    WouldBlock,
}

impl DeliveryError {
    pub fn error_code(self) -> ErrorCode {
        match self {
            DeliveryError::Unreachable => ErrorCode::PeerUnknown,
            DeliveryError::WouldBlock => ErrorCode::PeerUnavailable,
        }
    }
}
