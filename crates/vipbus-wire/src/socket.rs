//! Protocol socket: enforces VIP frame ordering on one connection.
//!
//! Frames are sent one at a time with a `more` flag and buffered until the
//! last frame, at which point the whole multipart message is written to the
//! channel. The PROTO frame is inserted on send and checked and stripped on
//! receive; callers never see it.
//!
//! States: `-1` VIA (ROUTER role only), `0` PEER, `1` PROTO, `2` USER_ID,
//! `3` MSG_ID, `4` SUBSYSTEM, `5+` arguments. A violation leaves the
//! direction unusable until `reset_send` / `reset_recv` is called.

use crate::error::{ProtocolError, WireError};
use crate::frame::Frame;
use crate::message::{Message, HEADER_FRAMES, PROTO};
use crate::stream::MultipartChannel;
use std::collections::VecDeque;
use tracing::debug;

/// Which side of a routed connection this socket plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketRole {
    /// Agent side: messages start with PEER.
    Dealer,
    /// Intermediary side: messages start with a VIA frame.
    Router,
}

impl SocketRole {
    fn initial_state(self) -> i32 {
        match self {
            SocketRole::Dealer => 0,
            SocketRole::Router => -1,
        }
    }

    /// Frames required before the first argument, PROTO included.
    pub fn header_frames(self) -> usize {
        match self {
            SocketRole::Dealer => HEADER_FRAMES,
            SocketRole::Router => HEADER_FRAMES + 1,
        }
    }
}

/// A VIP protocol socket over a multipart channel.
pub struct VipSocket<C> {
    channel: C,
    role: SocketRole,
    identity: Option<String>,
    send_state: i32,
    recv_state: i32,
    outgoing: Vec<Frame>,
    incoming: VecDeque<Frame>,
    send_failed: bool,
    recv_failed: bool,
}

impl<C: MultipartChannel> VipSocket<C> {
    pub fn new(channel: C, role: SocketRole) -> Self {
        let initial = role.initial_state();
        Self {
            channel,
            role,
            identity: None,
            send_state: initial,
            recv_state: initial,
            outgoing: Vec::new(),
            incoming: VecDeque::new(),
            send_failed: false,
            recv_failed: false,
        }
    }

    pub fn dealer(channel: C) -> Self {
        Self::new(channel, SocketRole::Dealer)
    }

    pub fn router(channel: C) -> Self {
        Self::new(channel, SocketRole::Router)
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    /// Identity assigned by the router during the handshake, if any.
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn role(&self) -> SocketRole {
        self.role
    }

    pub fn send_state(&self) -> i32 {
        self.send_state
    }

    pub fn recv_state(&self) -> i32 {
        self.recv_state
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    pub fn into_inner(self) -> C {
        self.channel
    }

    fn position(&self, state: i32) -> usize {
        (state - self.role.initial_state()).max(0) as usize
    }

    /// Send one frame of the current message.
    pub async fn send(&mut self, frame: impl Into<Frame>, more: bool) -> Result<(), WireError> {
        if self.send_failed {
            return Err(ProtocolError::SendInProgress.into());
        }
        let frame = frame.into();
        let state = self.send_state;

        if !more && state < 4 {
            let err = ProtocolError::Incomplete {
                expected: self.role.header_frames(),
                actual: self.position(state) + 1,
            };
            self.send_failed = true;
            return Err(err.into());
        }
        if state == 4 && frame.is_blank() {
            self.send_failed = true;
            return Err(ProtocolError::InvalidSubsystem(frame.to_string_lossy().into_owned()).into());
        }

        self.outgoing.push(frame);
        self.send_state = if state == 0 {
            self.outgoing.push(Frame::text(PROTO));
            2
        } else {
            state + 1
        };

        if !more {
            let frames = std::mem::take(&mut self.outgoing);
            self.send_state = self.role.initial_state();
            debug!(frames = frames.len(), "VIP: sending message");
            self.channel.send_multipart(frames).await?;
        }
        Ok(())
    }

    /// Send a complete message.
    pub async fn send_message(&mut self, msg: &Message) -> Result<(), WireError> {
        if self.send_failed || self.send_state != self.role.initial_state() {
            return Err(ProtocolError::SendInProgress.into());
        }
        if self.role == SocketRole::Router {
            let via = msg.via.clone().ok_or(ProtocolError::MissingVia)?;
            self.send(via, true).await?;
        }
        self.send(msg.peer.clone(), true).await?;
        self.send(msg.user_id.clone(), true).await?;
        self.send(msg.msg_id.clone(), true).await?;
        self.send(msg.subsystem.clone(), !msg.args.is_empty()).await?;
        let last = msg.args.len().saturating_sub(1);
        for (i, arg) in msg.args.iter().enumerate() {
            self.send(arg.clone(), i < last).await?;
        }
        Ok(())
    }

    /// Send a router probe: a single empty frame.
    ///
    /// The router sees `[identity, ""]` and registers the sender as a peer.
    pub async fn send_probe(&mut self) -> Result<(), WireError> {
        if self.send_failed || self.send_state != self.role.initial_state() {
            return Err(ProtocolError::SendInProgress.into());
        }
        self.channel.send_multipart(vec![Frame::empty()]).await
    }

    /// Receive the next frame and whether more frames follow.
    pub async fn recv(&mut self) -> Result<(Frame, bool), WireError> {
        if self.recv_failed {
            return Err(ProtocolError::RecvInProgress.into());
        }
        if self.incoming.is_empty() {
            let frames = self.channel.recv_multipart().await?;
            if let Err(e) = self.validate(&frames) {
                self.recv_failed = true;
                return Err(e.into());
            }
            let proto_at = self.position(1);
            self.incoming = frames
                .into_iter()
                .enumerate()
                .filter(|(i, _)| *i != proto_at)
                .map(|(_, f)| f)
                .collect();
        }

        let frame = self
            .incoming
            .pop_front()
            .ok_or_else(|| WireError::Malformed("empty message".into()))?;
        let more = !self.incoming.is_empty();
        self.recv_state = if more {
            if self.recv_state == 0 {
                2
            } else {
                self.recv_state + 1
            }
        } else {
            self.role.initial_state()
        };
        Ok((frame, more))
    }

    /// Receive a complete message.
    pub async fn recv_message(&mut self) -> Result<Message, WireError> {
        if self.recv_failed || self.recv_state != self.role.initial_state() {
            return Err(ProtocolError::RecvInProgress.into());
        }
        let via = match self.role {
            SocketRole::Router => Some(self.recv().await?.0),
            SocketRole::Dealer => None,
        };
        let (peer, _) = self.recv().await?;
        let (user_id, _) = self.recv().await?;
        let (msg_id, _) = self.recv().await?;
        let (subsystem, mut more) = self.recv().await?;
        let mut args = Vec::new();
        while more {
            let (arg, m) = self.recv().await?;
            args.push(arg);
            more = m;
        }
        Ok(Message {
            via,
            peer,
            user_id,
            msg_id,
            subsystem,
            args,
        })
    }

    fn validate(&self, frames: &[Frame]) -> Result<(), ProtocolError> {
        let expected = self.role.header_frames();
        if frames.len() < expected {
            return Err(ProtocolError::Incomplete {
                expected,
                actual: frames.len(),
            });
        }
        let proto = &frames[self.position(1)];
        if *proto != PROTO {
            return Err(ProtocolError::InvalidSignature(
                proto.to_string_lossy().into_owned(),
            ));
        }
        let subsystem = &frames[self.position(4)];
        if subsystem.is_blank() {
            return Err(ProtocolError::InvalidSubsystem(
                subsystem.to_string_lossy().into_owned(),
            ));
        }
        Ok(())
    }

    /// Abort the outgoing message and discard buffered frames.
    pub fn reset_send(&mut self) {
        self.outgoing.clear();
        self.send_state = self.role.initial_state();
        self.send_failed = false;
    }

    /// Abort the incoming message and discard buffered frames.
    pub fn reset_recv(&mut self) {
        self.incoming.clear();
        self.recv_state = self.role.initial_state();
        self.recv_failed = false;
    }
}

impl<C> std::fmt::Debug for VipSocket<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VipSocket")
            .field("role", &self.role)
            .field("identity", &self.identity)
            .field("send_state", &self.send_state)
            .field("recv_state", &self.recv_state)
            .finish()
    }
}
