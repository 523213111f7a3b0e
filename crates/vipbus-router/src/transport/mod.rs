//! Transport backends.
//!
//! A transport delivers inbound messages to the router loop and exposes a
//! [`FrameSink`] for outbound delivery. Frames handed to the sink are in
//! router order: `[destination, sender, VIP1, user_id, msg_id, subsystem,
//! args...]`; the destination frame is consumed by the transport.

pub mod broker;
pub mod direct;
pub mod proxy;

use crate::config::MessageBus;
use crate::error::DeliveryError;
use async_trait::async_trait;
use vipbus_wire::Frame;

/// Non-blocking outbound delivery.
pub trait FrameSink: Send + Sync {
    /// Deliver `frames` to the peer named by `frames[0]`.
    fn send_frames(&self, frames: Vec<Frame>) -> Result<(), DeliveryError>;

    /// Which bus `peer` is reachable over.
    fn bus_kind(&self, peer: &str) -> MessageBus;

    /// Tear down the connection to `peer`, if the transport holds one.
    fn close_peer(&self, peer: &str);
}

/// Something that happened on a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A message from a peer: `[sender, recipient, VIP1, ...]`.
    Inbound {
        frames: Vec<Frame>,
        /// Key id the peer's connection authenticated with.
        credential: Option<String>,
    },
    /// A peer's connection went away.
    Disconnected { peer: String },
    /// A message an agent sent that matched no destination, in router order.
    Undeliverable { frames: Vec<Frame> },
}

/// A bound transport feeding one router loop.
#[async_trait]
pub trait Transport: Send + 'static {
    fn sink(&self) -> std::sync::Arc<dyn FrameSink>;

    /// Addresses agents can reach this transport on.
    fn local_addresses(&self) -> Vec<String> {
        Vec::new()
    }

    /// Next event; `None` once the transport has shut down.
    async fn recv(&mut self) -> Option<TransportEvent>;

    async fn close(&mut self);
}

/// The destination frame as a string.
pub(crate) fn destination(frames: &[Frame]) -> Option<String> {
    frames.first().map(|f| f.to_string_lossy().into_owned())
}
