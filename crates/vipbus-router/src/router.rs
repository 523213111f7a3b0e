//! Router core: peer table, subsystem dispatch and delivery.
//!
//! [`Router::route`] is called once per inbound message from the router loop.
//! Inbound frames are `[SENDER, RECIPIENT, PROTO, USER_ID, MSG_ID, SUBSYSTEM,
//! ARGS...]`. Messages with an empty recipient are answered by the router;
//! everything else is forwarded with the header rewritten to `[RECIPIENT,
//! SENDER, PROTO, USER_ID]`.

use crate::auth::CredentialStore;
use crate::config::{MessageBus, PlatformConfig, RouterConfig};
use crate::error::DeliveryError;
use crate::external_rpc::ExternalRpcBridge;
use crate::hooks::{Authenticator, NullPubSub, PubSub};
use crate::peers::{PeerEntry, PeerTable};
use crate::routing::{LinkEvent, PlatformInfo, RoutingService};
use crate::subsystem::{Handled, Subsystem};
use crate::transport::FrameSink;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use vipbus_wire::{ErrorCode, Frame, PROTO, PROTOCOL_VERSION};

/// Whether the router loop should keep running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

fn text(frame: &Frame) -> String {
    frame.to_string_lossy().into_owned()
}

/// Build a router reply: `[sender, "", VIP1, user_id, msg_id, subsystem, args...]`.
fn reply_frames(
    sender: &Frame,
    user_id: &Frame,
    msg_id: &Frame,
    subsystem: &Frame,
    args: Vec<Frame>,
) -> Vec<Frame> {
    let mut frames = Vec::with_capacity(6 + args.len());
    frames.push(sender.clone());
    frames.push(Frame::empty());
    frames.push(Frame::text(PROTO));
    frames.push(user_id.clone());
    frames.push(msg_id.clone());
    frames.push(subsystem.clone());
    frames.extend(args);
    frames
}

/// The VIP router.
pub struct Router {
    config: RouterConfig,
    peers: PeerTable,
    pubsub: Box<dyn PubSub>,
    auth: Arc<dyn Authenticator>,
    routing: RoutingService,
    external_rpc: ExternalRpcBridge,
    sink: Arc<dyn FrameSink>,
}

impl Router {
    /// Create a router delivering through `sink`.
    ///
    /// Federation link tasks report through `link_events`; the owner of the
    /// receiving end must feed those events back via
    /// [`Router::handle_link_event`].
    pub fn new(
        config: RouterConfig,
        sink: Arc<dyn FrameSink>,
        credentials: Arc<CredentialStore>,
        link_events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        let routing = RoutingService::new(
            &config,
            Arc::clone(&sink),
            Arc::clone(&credentials),
            link_events,
        );
        Self {
            config,
            peers: PeerTable::new(),
            pubsub: Box::new(NullPubSub),
            auth: credentials,
            routing,
            external_rpc: ExternalRpcBridge,
            sink,
        }
    }

    pub fn with_pubsub(mut self, pubsub: Box<dyn PubSub>) -> Self {
        self.pubsub = pubsub;
        self
    }

    pub fn with_authenticator(mut self, auth: Arc<dyn Authenticator>) -> Self {
        self.auth = auth;
        self
    }

    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Replace the advertised addresses with the ones actually bound.
    pub fn set_addresses(&mut self, addresses: Vec<String>) {
        if !addresses.is_empty() {
            self.config.bind_addresses = addresses;
        }
    }

    /// Identities of all known peers.
    pub fn peers(&self) -> Vec<String> {
        self.peers.identities()
    }

    pub fn peer_entries(&self) -> Vec<PeerEntry> {
        self.peers.snapshot()
    }

    pub fn routing(&self) -> &RoutingService {
        &self.routing
    }

    pub fn platforms(&self) -> Vec<PlatformInfo> {
        self.routing.platforms()
    }

    pub fn connect_platform(&mut self, platform: PlatformConfig) {
        self.routing.connect(platform);
    }

    pub fn disconnect_platform(&mut self, instance: &str) -> bool {
        self.routing.disconnect(instance, self.pubsub.as_mut())
    }

    /// Stop all federation links.
    pub fn shutdown(&mut self) {
        self.routing.shutdown();
    }

    /// Route one inbound message.
    pub fn route(&mut self, mut frames: Vec<Frame>, credential: Option<&str>) -> Flow {
        debug!(frames = ?frames, "VIP: incoming message");
        if frames.len() < 6 {
            if frames.len() == 2 && !frames[0].is_empty() && frames[1].is_empty() {
                debug!(peer = %frames[0].to_string_lossy(), "VIP: router probe");
                let sender = text(&frames[0]);
                self.add_peer(&sender);
            } else {
                error!(frames = ?frames, "VIP: unroutable message");
            }
            return Flow::Continue;
        }
        if frames[2] != PROTO {
            error!(frames = ?frames, "VIP: invalid protocol signature");
            return Flow::Continue;
        }

        let sender = text(&frames[0]);
        let recipient = text(&frames[1]);
        let user_id = match self.auth.lookup_user_id(&sender, &recipient, credential) {
            Some(user_id) => user_id,
            None => {
                warn!(peer = %sender, "VIP: missing user ID");
                self.config.default_user_id.clone()
            }
        };
        self.add_peer(&sender);

        if !recipient.is_empty() {
            frames[0] = Frame::text(recipient);
            frames[1] = Frame::text(sender.as_str());
            frames[3] = Frame::text(user_id);
            self.deliver(frames, &sender);
            return Flow::Continue;
        }

        frames[3] = Frame::text(user_id);
        let subsystem = Subsystem::parse(&frames[5]);
        if subsystem == Subsystem::Quit {
            if sender == self.config.control_identity && frames[3].is_empty() {
                info!(peer = %sender, "VIP: quit requested");
                return Flow::Stop;
            }
            warn!(peer = %sender, "VIP: ignoring quit from unprivileged peer");
            self.reply_unsupported(&frames, &subsystem, &sender);
            return Flow::Continue;
        }

        let args = match self.dispatch(&subsystem, &sender, &frames) {
            Handled::Reply(args) => args,
            Handled::NoReply => return Flow::Continue,
            Handled::Unsupported => {
                error!(peer = %sender, subsystem = %subsystem, "VIP: unknown subsystem");
                self.reply_unsupported(&frames, &subsystem, &sender);
                return Flow::Continue;
            }
        };
        let reply = reply_frames(&frames[0], &frames[3], &frames[4], &frames[5], args);
        self.deliver(reply, &sender);
        Flow::Continue
    }

    /// Answer a router-addressed message with error 51.
    fn reply_unsupported(&mut self, frames: &[Frame], subsystem: &Subsystem, sender: &str) {
        let mut reply = reply_frames(
            &frames[0],
            &frames[3],
            &frames[4],
            &Frame::text("error"),
            Vec::new(),
        );
        reply.push(ErrorCode::NotImplemented.code_frame());
        reply.push(ErrorCode::NotImplemented.message_frame());
        reply.push(Frame::empty());
        reply.push(Frame::text(subsystem.as_str()));
        self.deliver(reply, sender);
    }

    /// Handle a message that arrived over an outbound federation link.
    ///
    /// `frames` are in dealer order: `[PEER, PROTO, USER_ID, MSG_ID,
    /// SUBSYSTEM, ARGS...]`. The instance is not registered as a local peer.
    pub fn route_federated(&mut self, instance: &str, frames: Vec<Frame>) {
        if frames.len() < 5 || frames[1] != PROTO {
            error!(instance, frames = ?frames, "VIP: unroutable federated message");
            return;
        }
        let mut full = Vec::with_capacity(frames.len() + 1);
        full.push(Frame::text(instance));
        full.push(Frame::empty());
        full.extend(frames.into_iter().skip(1));

        let subsystem = Subsystem::parse(&full[5]);
        let handled = match subsystem {
            Subsystem::RoutingTable | Subsystem::ExternalRpc | Subsystem::PubSub => {
                self.dispatch(&subsystem, instance, &full)
            }
            _ => {
                debug!(instance, subsystem = %subsystem, "VIP: ignoring federated subsystem");
                Handled::NoReply
            }
        };
        if let Handled::Reply(args) = handled {
            let mut reply = reply_frames(&Frame::empty(), &full[3], &full[4], &full[5], args);
            reply.remove(1);
            if let Err(e) = self.routing.send(instance, reply) {
                warn!(instance, error = %e, "VIP: federated reply failed");
            }
        }
    }

    /// Feed a federation link event back into the router.
    pub fn handle_link_event(&mut self, event: LinkEvent) {
        if let Some((instance, frames)) = self.routing.handle_link_event(event, self.pubsub.as_mut()) {
            self.route_federated(&instance, frames);
        }
    }

    /// A transport connection went away.
    pub fn peer_disconnected(&mut self, peer: &str) {
        self.drop_peer(peer);
        self.routing.peer_disconnected(peer, self.pubsub.as_mut());
    }

    /// A message an agent sent to a destination that does not exist, in
    /// router order.
    pub fn undeliverable(&mut self, frames: Vec<Frame>) {
        if frames.len() < 6 {
            error!(frames = ?frames, "VIP: malformed undeliverable message");
            return;
        }
        let dest = text(&frames[0]);
        let sender = text(&frames[1]);
        error!(peer = %dest, "VIP: send failure: {}", DeliveryError::Unreachable);
        self.delivery_failed(
            DeliveryError::Unreachable,
            &dest,
            &sender,
            &frames[3],
            &frames[4],
            &frames[5],
        );
    }

    fn dispatch(&mut self, subsystem: &Subsystem, sender: &str, frames: &[Frame]) -> Handled {
        let args = &frames[6..];
        match subsystem {
            Subsystem::Hello => {
                if let Some(reason) = self.auth.check_permissions(sender) {
                    warn!(peer = %sender, reason = %reason, "VIP: permission check failed");
                }
                Handled::Reply(vec![
                    Frame::text("welcome"),
                    Frame::text(PROTOCOL_VERSION),
                    Frame::text(self.config.identity.as_str()),
                    Frame::text(sender),
                ])
            }
            Subsystem::Ping => Handled::Reply(vec![Frame::text("pong")]),
            Subsystem::Peerlist => self.handle_peerlist(sender, args),
            Subsystem::Query => {
                let name = args.first().map(text).unwrap_or_default();
                let value = self.query(&name);
                Handled::Reply(vec![
                    Frame::text(name),
                    Frame::text(value.to_string()),
                    Frame::empty(),
                ])
            }
            Subsystem::AgentStop => {
                if let Some(peer) = args.first() {
                    let peer = text(peer);
                    info!(peer = %peer, "VIP: agent stopped");
                    self.drop_peer(&peer);
                }
                Handled::NoReply
            }
            Subsystem::Error => {
                match (args.first(), args.get(2)) {
                    (Some(code), Some(recipient)) => {
                        let code = code.to_str().and_then(|s| s.trim().parse::<u16>().ok());
                        if code == Some(ErrorCode::PeerUnknown.code()) {
                            self.drop_peer(&text(recipient));
                        }
                    }
                    _ => error!(peer = %sender, "VIP: unable to parse error message"),
                }
                Handled::NoReply
            }
            Subsystem::PubSub => self.pubsub.handle_subsystem(frames, self.sink.as_ref()),
            Subsystem::ExternalRpc => {
                if let Some(local) = self.external_rpc.handle(frames, &mut self.routing) {
                    self.deliver(local, "");
                }
                Handled::NoReply
            }
            Subsystem::RoutingTable => self.routing.handle_subsystem(frames, self.pubsub.as_mut()),
            Subsystem::Quit | Subsystem::Other(_) => Handled::Unsupported,
        }
    }

    fn handle_peerlist(&mut self, sender: &str, args: &[Frame]) -> Handled {
        let op = args.first().map(text);
        match op.as_deref() {
            Some("list") => {
                let mut reply = vec![Frame::text("listing")];
                reply.extend(self.peers.identities().into_iter().map(Frame::text));
                Handled::Reply(reply)
            }
            Some("list_with_messagebus") => {
                let listing: BTreeMap<String, &str> = self
                    .peers
                    .snapshot()
                    .into_iter()
                    .map(|p| (p.identity, p.bus.as_str()))
                    .collect();
                Handled::Reply(vec![
                    Frame::text("listing_with_messagebus"),
                    Frame::text(json!(listing).to_string()),
                ])
            }
            Some(op @ ("add" | "drop")) if sender == self.config.proxy_identity => {
                match args.get(1).map(text) {
                    Some(peer) if op == "add" => {
                        self.add_peer_via(&peer, MessageBus::Direct);
                    }
                    Some(peer) => {
                        self.drop_peer(&peer);
                    }
                    None => warn!(peer = %sender, "VIP: peerlist {} without a peer", op),
                }
                Handled::NoReply
            }
            Some(op @ ("add" | "drop")) => {
                warn!(peer = %sender, "VIP: peerlist {} is reserved for the proxy router", op);
                Handled::NoReply
            }
            Some(_) => Handled::Reply(vec![
                Frame::text("error"),
                Frame::text("unknown operation"),
            ]),
            None => Handled::Reply(vec![
                Frame::text("error"),
                Frame::text("missing operation"),
            ]),
        }
    }

    fn query(&self, name: &str) -> Value {
        let config = &self.config;
        match name {
            "addresses" => json!(config.bind_addresses),
            "local_address" => json!(config.local_address()),
            "serverkey" => json!(config.server_key),
            "instance-name" => json!(config.instance_name),
            "bind-web-address" => json!(config.bind_web_address),
            "platform-version" => json!(env!("CARGO_PKG_VERSION")),
            "message-bus" => json!(config.message_bus.as_str()),
            "central-address" => json!(config.central_address),
            "central-serverkey" => json!(config.central_serverkey),
            _ => Value::Null,
        }
    }

    /// Register a peer reachable over the sink's own bus.
    pub fn add_peer(&mut self, peer: &str) -> bool {
        let bus = self.sink.bus_kind(peer);
        self.add_peer_via(peer, bus)
    }

    /// Register a peer. Existing peers and the router itself are ignored.
    pub fn add_peer_via(&mut self, peer: &str, bus: MessageBus) -> bool {
        if peer.is_empty() || peer == self.config.identity || self.peers.contains(peer) {
            return false;
        }
        self.distribute("peerlist", &["add", peer]);
        self.peers.insert(peer, bus);
        info!(peer, bus = %bus, "VIP: peer added");
        self.pubsub.on_peer_added(peer);
        true
    }

    /// Remove a peer and tell everyone else.
    pub fn drop_peer(&mut self, peer: &str) -> bool {
        if self.peers.remove(peer).is_none() {
            return false;
        }
        info!(peer, "VIP: peer dropped");
        self.distribute("peerlist", &["drop", peer]);
        self.pubsub.on_peer_dropped(peer);
        true
    }

    /// Send a router notification to every known peer.
    fn distribute(&mut self, subsystem: &str, args: &[&str]) {
        let mut unreachable = Vec::new();
        for peer in self.peers.identities() {
            let mut frames = vec![
                Frame::text(peer.as_str()),
                Frame::empty(),
                Frame::text(PROTO),
                Frame::empty(),
                Frame::empty(),
                Frame::text(subsystem),
            ];
            frames.extend(args.iter().map(|a| Frame::text(*a)));
            match self.sink.send_frames(frames) {
                Ok(()) => {}
                Err(DeliveryError::Unreachable) => unreachable.push(peer),
                Err(DeliveryError::WouldBlock) => {
                    debug!(peer = %peer, subsystem, "VIP: notification dropped, peer busy");
                }
            }
        }
        for peer in unreachable {
            self.drop_peer(&peer);
        }
    }

    /// Hand router-order frames to the transport.
    fn deliver(&mut self, frames: Vec<Frame>, origin: &str) {
        let dest = text(&frames[0]);
        let (user_id, msg_id, subsystem) = (frames[3].clone(), frames[4].clone(), frames[5].clone());
        debug!(frames = ?frames, "VIP: outgoing message");
        if let Err(e) = self.sink.send_frames(frames) {
            error!(peer = %dest, error = %e, "VIP: send failure");
            self.delivery_failed(e, &dest, origin, &user_id, &msg_id, &subsystem);
        }
    }

    fn delivery_failed(
        &mut self,
        err: DeliveryError,
        dest: &str,
        origin: &str,
        user_id: &Frame,
        msg_id: &Frame,
        subsystem: &Frame,
    ) {
        if err == DeliveryError::Unreachable {
            self.drop_peer(dest);
        }
        if origin.is_empty() || origin == dest {
            return;
        }
        let code = err.error_code();
        let mut frames = reply_frames(
            &Frame::text(origin),
            user_id,
            msg_id,
            &Frame::text("error"),
            Vec::new(),
        );
        frames.push(code.code_frame());
        frames.push(code.message_frame());
        frames.push(Frame::text(dest));
        frames.push(subsystem.clone());
        debug!(frames = ?frames, "VIP: outgoing error");
        if let Err(e) = self.sink.send_frames(frames) {
            debug!(peer = %origin, error = %e, "VIP: error reply not delivered");
        }
    }
}
