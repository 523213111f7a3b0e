//! VIP message envelope and protocol constants.
//!
//! On the wire a message is the frame sequence
//! `[VIA?, PEER, PROTO, USER_ID, MSG_ID, SUBSYSTEM, ARG...]`. The router sees
//! the sender's identity in the first position and the recipient in the
//! second; an empty recipient addresses the router itself.

use crate::frame::Frame;
use serde::{Deserialize, Serialize};

/// Protocol signature carried in the PROTO frame.
pub const PROTO: &str = "VIP1";

/// Version string returned in `welcome` replies.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Number of frames before the first argument, counting PROTO.
pub const HEADER_FRAMES: usize = 5;

/// Error codes carried in `error` subsystem messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    PeerUnknown,
    PeerUnavailable,
    BadRequest,
    Unauthorized,
    InternalError,
    NotImplemented,
}

impl ErrorCode {
    pub fn code(self) -> u16 {
        match self {
            ErrorCode::PeerUnknown => 30,
            ErrorCode::PeerUnavailable => 31,
            ErrorCode::BadRequest => 40,
            ErrorCode::Unauthorized => 41,
            ErrorCode::InternalError => 50,
            ErrorCode::NotImplemented => 51,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::PeerUnknown => "Peer unknown",
            ErrorCode::PeerUnavailable => "Peer temporarily unavailable",
            ErrorCode::BadRequest => "Bad request",
            ErrorCode::Unauthorized => "Unauthorized",
            ErrorCode::InternalError => "Internal error",
            ErrorCode::NotImplemented => "Not implemented",
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            30 => Some(ErrorCode::PeerUnknown),
            31 => Some(ErrorCode::PeerUnavailable),
            40 => Some(ErrorCode::BadRequest),
            41 => Some(ErrorCode::Unauthorized),
            50 => Some(ErrorCode::InternalError),
            51 => Some(ErrorCode::NotImplemented),
            _ => None,
        }
    }

    /// The code as a text frame, as it travels in `error` arguments.
    pub fn code_frame(self) -> Frame {
        Frame::text(self.code().to_string())
    }

    pub fn message_frame(self) -> Frame {
        Frame::text(self.message())
    }
}

/// A complete VIP message as seen by an agent socket.
///
/// `peer` is the recipient when sending and the sender when receiving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Intermediary frame used by ROUTER-role sockets.
    pub via: Option<Frame>,
    pub peer: Frame,
    pub user_id: Frame,
    pub msg_id: Frame,
    pub subsystem: Frame,
    pub args: Vec<Frame>,
}

impl Message {
    pub fn new(peer: impl Into<Frame>, subsystem: impl Into<Frame>) -> Self {
        Self {
            via: None,
            peer: peer.into(),
            user_id: Frame::empty(),
            msg_id: Frame::empty(),
            subsystem: subsystem.into(),
            args: Vec::new(),
        }
    }

    pub fn with_via(mut self, via: impl Into<Frame>) -> Self {
        self.via = Some(via.into());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<Frame>) -> Self {
        self.user_id = user_id.into();
        self
    }

    pub fn with_msg_id(mut self, msg_id: impl Into<Frame>) -> Self {
        self.msg_id = msg_id.into();
        self
    }

    pub fn with_args<I, F>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: Into<Frame>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Flatten into wire order, PROTO included.
    pub fn into_frames(self) -> Vec<Frame> {
        let mut out = Vec::with_capacity(6 + self.args.len());
        if let Some(via) = self.via {
            out.push(via);
        }
        out.push(self.peer);
        out.push(Frame::text(PROTO));
        out.push(self.user_id);
        out.push(self.msg_id);
        out.push(self.subsystem);
        out.extend(self.args);
        out
    }
}
