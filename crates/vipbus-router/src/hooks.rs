//! Collaborator interfaces the router calls into.
//!
//! Pub/sub and authentication live outside the router core. The router owns
//! the collaborator and calls it from its loop, so implementations never see
//! concurrent calls.

use crate::subsystem::Handled;
use crate::transport::FrameSink;
use vipbus_wire::Frame;

/// Publish/subscribe collaborator.
pub trait PubSub: Send {
    /// Handle a router-addressed `pubsub` message.
    ///
    /// `frames` is the full message `[sender, "", VIP1, user_id, msg_id,
    /// "pubsub", args...]` with the resolved user id.
    fn handle_subsystem(&mut self, frames: &[Frame], sink: &dyn FrameSink) -> Handled;

    fn on_peer_added(&mut self, _peer: &str) {}

    fn on_peer_dropped(&mut self, _peer: &str) {}

    /// A remote instance became reachable.
    ///
    /// Returns messages to send to it, e.g. replayed subscriptions. Each is
    /// `["", VIP1, user_id, msg_id, subsystem, args...]`.
    fn on_federation_connect(&mut self, _instance: &str) -> Vec<Vec<Frame>> {
        Vec::new()
    }

    fn on_federation_disconnect(&mut self, _instance: &str) {}
}

/// Pub/sub collaborator that supports nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPubSub;

impl PubSub for NullPubSub {
    fn handle_subsystem(&mut self, _frames: &[Frame], _sink: &dyn FrameSink) -> Handled {
        Handled::Unsupported
    }
}

/// Authentication collaborator.
pub trait Authenticator: Send + Sync {
    /// Map a sender and the credential its connection proved to a user id.
    fn lookup_user_id(&self, sender: &str, recipient: &str, credential: Option<&str>)
        -> Option<String>;

    /// Returns an error message if `identity` lacks permissions.
    fn check_permissions(&self, identity: &str) -> Option<String>;
}
