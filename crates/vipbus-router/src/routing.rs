//! Routing service: federation with remote platform instances.
//!
//! Each configured platform gets an outbound link task that connects to the
//! remote router, introduces itself with `routing_table hello` and then pumps
//! frames both ways. Link tasks never touch router state; they report
//! [`LinkEvent`]s which the router loop feeds back through
//! [`RoutingService::handle_link_event`].
//!
//! A remote instance may also connect to us as an ordinary peer and say
//! `hello`; such inbound platforms are reached through the local transport.

use crate::auth::CredentialStore;
use crate::config::{FederationConfig, PlatformConfig, RouterConfig};
use crate::error::DeliveryError;
use crate::hooks::PubSub;
use crate::subsystem::Handled;
use crate::transport::FrameSink;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vipbus_wire::handshake::client_handshake;
use vipbus_wire::stream::{read_multipart, write_multipart};
use vipbus_wire::{Credential, Frame, FramedStream, WireError, PROTO};

/// Connection state of a remote platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformState {
    Connecting,
    ConnectionDelayed,
    Connected,
    Disconnected,
}

/// Reported by federation link tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// TCP connection and handshake succeeded; `hello` has been sent.
    Connected { id: u64, instance: String },
    ConnectDelayed {
        id: u64,
        instance: String,
        attempt: u32,
        error: String,
    },
    Disconnected { id: u64, instance: String },
    /// A message from the remote router: `[PEER, VIP1, USER_ID, MSG_ID,
    /// SUBSYSTEM, ARGS...]`.
    Frames {
        id: u64,
        instance: String,
        frames: Vec<Frame>,
    },
}

impl LinkEvent {
    fn id(&self) -> u64 {
        match self {
            LinkEvent::Connected { id, .. }
            | LinkEvent::ConnectDelayed { id, .. }
            | LinkEvent::Disconnected { id, .. }
            | LinkEvent::Frames { id, .. } => *id,
        }
    }

    pub fn instance(&self) -> &str {
        match self {
            LinkEvent::Connected { instance, .. }
            | LinkEvent::ConnectDelayed { instance, .. }
            | LinkEvent::Disconnected { instance, .. }
            | LinkEvent::Frames { instance, .. } => instance,
        }
    }
}

struct LinkHandle {
    id: u64,
    tx: mpsc::Sender<Vec<Frame>>,
    task: JoinHandle<()>,
}

struct PlatformEntry {
    address: Option<String>,
    web_address: Option<String>,
    state: PlatformState,
    /// The remote holds a connection to our transport.
    inbound: bool,
    link: Option<LinkHandle>,
    connected_at: Option<DateTime<Utc>>,
}

impl PlatformEntry {
    fn new() -> Self {
        Self {
            address: None,
            web_address: None,
            state: PlatformState::Connecting,
            inbound: false,
            link: None,
            connected_at: None,
        }
    }
}

/// Snapshot of a remote platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlatformInfo {
    pub instance_name: String,
    pub address: Option<String>,
    pub web_address: Option<String>,
    pub state: PlatformState,
    pub inbound: bool,
    pub connected_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct SetupRequest {
    instance_name: String,
    credential: Credential,
}

/// Tracks remote platforms and the routes to them.
pub struct RoutingService {
    instance_name: String,
    web_address: Option<String>,
    sink: Arc<dyn FrameSink>,
    credentials: Arc<CredentialStore>,
    link_events: mpsc::UnboundedSender<LinkEvent>,
    federation: FederationConfig,
    platforms: BTreeMap<String, PlatformEntry>,
    /// vip_id -> chain of instances to go through, nearest first.
    routes: BTreeMap<String, Vec<String>>,
    next_link_id: u64,
}

impl RoutingService {
    pub fn new(
        config: &RouterConfig,
        sink: Arc<dyn FrameSink>,
        credentials: Arc<CredentialStore>,
        link_events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        Self {
            instance_name: config.instance_name.clone(),
            web_address: config.bind_web_address.clone(),
            sink,
            credentials,
            link_events,
            federation: config.federation.clone(),
            platforms: BTreeMap::new(),
            routes: BTreeMap::new(),
            next_link_id: 0,
        }
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    /// Start an outbound link to `platform`. Already-linked platforms are left alone.
    pub fn connect(&mut self, platform: PlatformConfig) {
        let name = platform.instance_name.clone();
        if name.is_empty() || name == self.instance_name {
            warn!(instance = %name, "VIP: refusing to federate with this instance name");
            return;
        }
        if self.platforms.get(&name).is_some_and(|e| e.link.is_some()) {
            debug!(instance = %name, "VIP: platform already linked");
            return;
        }

        self.next_link_id += 1;
        let id = self.next_link_id;
        let (tx, rx) = mpsc::channel(self.federation.link_queue_depth.max(1));
        let params = LinkParams {
            id,
            instance: name.clone(),
            address: platform.address.clone(),
            credential: platform.credential,
            local_name: self.instance_name.clone(),
            events: self.link_events.clone(),
            initial: self.federation.reconnect_initial(),
            max: self.federation.reconnect_max(),
        };
        let task = tokio::spawn(run_link(params, rx));

        let entry = self.platforms.entry(name.clone()).or_insert_with(PlatformEntry::new);
        entry.address = Some(platform.address);
        if platform.web_address.is_some() {
            entry.web_address = platform.web_address;
        }
        entry.link = Some(LinkHandle { id, tx, task });
        if entry.state != PlatformState::Connected {
            entry.state = PlatformState::Connecting;
        }
        info!(instance = %name, "VIP: connecting to platform");
    }

    /// Forget a platform, closing whatever connects us to it.
    pub fn disconnect(&mut self, instance: &str, hooks: &mut dyn PubSub) -> bool {
        let Some(entry) = self.platforms.remove(instance) else {
            return false;
        };
        if let Some(link) = entry.link {
            link.task.abort();
        }
        if entry.inbound {
            self.sink.close_peer(instance);
        }
        if entry.state == PlatformState::Connected {
            hooks.on_federation_disconnect(instance);
        }
        info!(instance, "VIP: platform disconnected");
        true
    }

    /// Abort every link task.
    pub fn shutdown(&mut self) {
        for entry in self.platforms.values_mut() {
            if let Some(link) = entry.link.take() {
                link.task.abort();
            }
        }
    }

    /// Send dealer-form frames (`["", VIP1, ...]`) to a remote instance.
    ///
    /// Linked platforms get the frames over their link, queued until the
    /// link is up. Anything else is handed to the local transport addressed
    /// to the instance name.
    pub fn send(&mut self, instance: &str, frames: Vec<Frame>) -> Result<(), DeliveryError> {
        if let Some(link) = self.platforms.get(instance).and_then(|e| e.link.as_ref()) {
            return link.tx.try_send(frames).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => DeliveryError::WouldBlock,
                mpsc::error::TrySendError::Closed(_) => DeliveryError::Unreachable,
            });
        }
        if !self.platforms.contains_key(instance) {
            debug!(instance, "VIP: unknown platform, using local transport");
        }
        let mut routed = Vec::with_capacity(frames.len() + 1);
        routed.push(Frame::text(instance));
        routed.extend(frames);
        self.sink.send_frames(routed)
    }

    /// Handle a `routing_table` message. `frames[0]` is the sending instance.
    pub fn handle_subsystem(&mut self, frames: &[Frame], hooks: &mut dyn PubSub) -> Handled {
        let sender = frames[0].to_string_lossy().into_owned();
        let args = &frames[6..];
        let Some(op) = args.first().and_then(|f| f.to_str()) else {
            warn!(peer = %sender, "VIP: routing_table message without an operation");
            return Handled::NoReply;
        };
        let payload = args.get(1).map(|f| f.to_string_lossy().into_owned());

        match op {
            "hello" => {
                let name = payload.filter(|n| !n.is_empty()).unwrap_or(sender);
                self.mark_connected(&name, true, hooks);
                Handled::Reply(vec![
                    Frame::text("welcome"),
                    Frame::text(self.instance_name.as_str()),
                ])
            }
            "welcome" => {
                let name = payload.filter(|n| !n.is_empty()).unwrap_or(sender);
                self.mark_connected(&name, false, hooks);
                Handled::NoReply
            }
            "update" => {
                let updated = match payload.as_deref().map(serde_json::from_str) {
                    Some(Ok(table)) => {
                        self.merge_routes(&sender, table);
                        true
                    }
                    Some(Err(e)) => {
                        warn!(peer = %sender, error = %e, "VIP: malformed routing table update");
                        false
                    }
                    None => false,
                };
                Handled::Reply(vec![
                    Frame::text("request_response"),
                    Frame::text(if updated { "true" } else { "false" }),
                ])
            }
            "web-addresses" => {
                let mut addresses: BTreeMap<&str, &str> = self
                    .platforms
                    .iter()
                    .filter_map(|(name, e)| e.web_address.as_deref().map(|w| (name.as_str(), w)))
                    .collect();
                if let Some(own) = &self.web_address {
                    addresses.insert(&self.instance_name, own);
                }
                let body = serde_json::to_string(&addresses).unwrap_or_default();
                Handled::Reply(vec![Frame::text(body)])
            }
            "setupmode_platform_connection" => {
                match payload.as_deref().map(serde_json::from_str::<SetupRequest>) {
                    Some(Ok(req)) => {
                        self.credentials.add(
                            &req.credential.key_id,
                            &req.credential.secret,
                            &req.instance_name,
                        );
                        info!(instance = %req.instance_name, "VIP: platform pre-authorised");
                    }
                    _ => warn!(peer = %sender, "VIP: malformed setup mode request"),
                }
                Handled::NoReply
            }
            "normalmode_platform_connection" => {
                match payload.as_deref().map(serde_json::from_str::<PlatformConfig>) {
                    Some(Ok(platform)) => self.connect(platform),
                    _ => warn!(peer = %sender, "VIP: malformed platform connection request"),
                }
                Handled::NoReply
            }
            "request_response" => {
                debug!(peer = %sender, result = ?payload, "VIP: routing request answered");
                Handled::NoReply
            }
            other => {
                warn!(peer = %sender, op = other, "VIP: unknown routing_table operation");
                Handled::NoReply
            }
        }
    }

    /// Merge a remote routing table received from `sender`.
    fn merge_routes(&mut self, sender: &str, table: BTreeMap<String, Vec<String>>) {
        for (vip_id, remote) in table {
            if vip_id == self.instance_name {
                continue;
            }
            let better = match self.routes.get(&vip_id) {
                None => true,
                Some(current) => !remote.is_empty() && remote.len() < current.len(),
            };
            if better {
                let mut route = Vec::with_capacity(remote.len() + 1);
                route.push(sender.to_string());
                route.extend(remote);
                debug!(vip_id = %vip_id, route = ?route, "VIP: route updated");
                self.routes.insert(vip_id, route);
            }
        }
    }

    fn mark_connected(&mut self, name: &str, inbound: bool, hooks: &mut dyn PubSub) {
        let entry = self
            .platforms
            .entry(name.to_string())
            .or_insert_with(PlatformEntry::new);
        entry.inbound |= inbound;
        if entry.state == PlatformState::Connected {
            return;
        }
        entry.state = PlatformState::Connected;
        entry.connected_at = Some(Utc::now());
        info!(instance = name, inbound, "VIP: platform connected");
        for frames in hooks.on_federation_connect(name) {
            if let Err(e) = self.send(name, frames) {
                warn!(instance = name, error = %e, "VIP: replay to platform failed");
            }
        }
    }

    /// Apply a link task report. Returns frames for the router to dispatch.
    pub fn handle_link_event(
        &mut self,
        event: LinkEvent,
        hooks: &mut dyn PubSub,
    ) -> Option<(String, Vec<Frame>)> {
        let current = self
            .platforms
            .get_mut(event.instance())
            .filter(|e| e.link.as_ref().map(|l| l.id) == Some(event.id()));
        let Some(entry) = current else {
            debug!(instance = event.instance(), "VIP: stale link event");
            return None;
        };
        match event {
            LinkEvent::Connected { instance, .. } => {
                if entry.state != PlatformState::Connected {
                    entry.state = PlatformState::Connecting;
                }
                debug!(instance = %instance, "VIP: link up, waiting for welcome");
                None
            }
            LinkEvent::ConnectDelayed {
                instance,
                attempt,
                error,
                ..
            } => {
                if entry.state != PlatformState::Connected {
                    entry.state = PlatformState::ConnectionDelayed;
                }
                debug!(instance = %instance, attempt, error = %error, "VIP: platform connection delayed");
                None
            }
            LinkEvent::Disconnected { instance, .. } => {
                let was_connected = entry.state == PlatformState::Connected;
                entry.state = PlatformState::Disconnected;
                entry.connected_at = None;
                if was_connected {
                    hooks.on_federation_disconnect(&instance);
                }
                info!(instance = %instance, "VIP: federation link lost");
                None
            }
            LinkEvent::Frames {
                instance, frames, ..
            } => Some((instance, frames)),
        }
    }

    /// A local peer went away; forget it if it was an inbound platform.
    pub fn peer_disconnected(&mut self, peer: &str, hooks: &mut dyn PubSub) {
        let inbound_only = self
            .platforms
            .get(peer)
            .is_some_and(|e| e.inbound && e.link.is_none());
        if !inbound_only {
            if let Some(entry) = self.platforms.get_mut(peer) {
                entry.inbound = false;
            }
            return;
        }
        if let Some(entry) = self.platforms.remove(peer) {
            if entry.state == PlatformState::Connected {
                hooks.on_federation_disconnect(peer);
            }
            info!(instance = peer, "VIP: inbound platform went away");
        }
    }

    pub fn state(&self, instance: &str) -> Option<PlatformState> {
        self.platforms.get(instance).map(|e| e.state)
    }

    pub fn platforms(&self) -> Vec<PlatformInfo> {
        self.platforms
            .iter()
            .map(|(name, e)| PlatformInfo {
                instance_name: name.clone(),
                address: e.address.clone(),
                web_address: e.web_address.clone(),
                state: e.state,
                inbound: e.inbound,
                connected_at: e.connected_at,
            })
            .collect()
    }

    pub fn connected_platforms(&self) -> Vec<String> {
        self.platforms
            .iter()
            .filter(|(_, e)| e.state == PlatformState::Connected)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn routes(&self) -> &BTreeMap<String, Vec<String>> {
        &self.routes
    }
}

impl Drop for RoutingService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct LinkParams {
    id: u64,
    instance: String,
    address: String,
    credential: Option<Credential>,
    local_name: String,
    events: mpsc::UnboundedSender<LinkEvent>,
    initial: Duration,
    max: Duration,
}

enum LinkExit {
    /// The router dropped the link.
    Closed,
    Lost(String),
}

/// Add up to a quarter of `delay` so linked instances do not retry in step.
fn with_jitter(delay: Duration) -> Duration {
    let spread = (delay.as_millis() as u64 / 4).max(1);
    let jitter = rand::thread_rng().gen_range(0..=spread);
    delay + Duration::from_millis(jitter)
}

async fn open_link(
    address: &str,
    identity: &str,
    credential: Option<&Credential>,
) -> Result<TcpStream, WireError> {
    let stream = TcpStream::connect(address).await?;
    stream.set_nodelay(true)?;
    let mut channel = FramedStream::new(stream);
    let assigned = client_handshake(&mut channel, identity, credential).await?;
    if assigned != identity {
        warn!(identity, assigned = %assigned, "VIP: remote router renamed this instance");
    }
    Ok(channel.into_inner())
}

async fn run_link(params: LinkParams, mut rx: mpsc::Receiver<Vec<Frame>>) {
    let LinkParams {
        id,
        instance,
        address,
        credential,
        local_name,
        events,
        initial,
        max,
    } = params;
    let mut backoff = initial;
    let mut attempt = 0u32;

    loop {
        match open_link(&address, &local_name, credential.as_ref()).await {
            Ok(stream) => {
                attempt = 0;
                backoff = initial;
                info!(instance = %instance, address = %address, "VIP: federation link established");
                let connected = LinkEvent::Connected {
                    id,
                    instance: instance.clone(),
                };
                if events.send(connected).is_err() {
                    return;
                }
                match pump_link(stream, id, &instance, &local_name, &mut rx, &events).await {
                    LinkExit::Closed => return,
                    LinkExit::Lost(reason) => {
                        warn!(instance = %instance, "VIP: federation link lost: {reason}");
                        let lost = LinkEvent::Disconnected {
                            id,
                            instance: instance.clone(),
                        };
                        if events.send(lost).is_err() {
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                attempt += 1;
                warn!(
                    instance = %instance,
                    attempt,
                    "VIP: federation connect failed: {e}, retrying in {backoff:?}"
                );
                let delayed = LinkEvent::ConnectDelayed {
                    id,
                    instance: instance.clone(),
                    attempt,
                    error: e.to_string(),
                };
                if events.send(delayed).is_err() {
                    return;
                }
            }
        }
        tokio::time::sleep(with_jitter(backoff)).await;
        backoff = (backoff * 2).min(max);
    }
}

async fn pump_link(
    stream: TcpStream,
    id: u64,
    instance: &str,
    local_name: &str,
    rx: &mut mpsc::Receiver<Vec<Frame>>,
    events: &mpsc::UnboundedSender<LinkEvent>,
) -> LinkExit {
    let (mut reader, mut writer) = stream.into_split();
    let hello = vec![
        Frame::empty(),
        Frame::text(PROTO),
        Frame::empty(),
        Frame::text(uuid::Uuid::new_v4().to_string()),
        Frame::text("routing_table"),
        Frame::text("hello"),
        Frame::text(local_name),
    ];
    if let Err(e) = write_multipart(&mut writer, &hello).await {
        return LinkExit::Lost(e.to_string());
    }

    let reader_events = events.clone();
    let reader_instance = instance.to_string();
    let mut reader_task = tokio::spawn(async move {
        loop {
            match read_multipart(&mut reader).await {
                Ok(frames) => {
                    let event = LinkEvent::Frames {
                        id,
                        instance: reader_instance.clone(),
                        frames,
                    };
                    if reader_events.send(event).is_err() {
                        return "router stopped".to_string();
                    }
                }
                Err(e) => return e.to_string(),
            }
        }
    });

    let exit = loop {
        tokio::select! {
            result = &mut reader_task => {
                break LinkExit::Lost(result.unwrap_or_else(|e| e.to_string()));
            }
            frames = rx.recv() => match frames {
                Some(frames) => {
                    if let Err(e) = write_multipart(&mut writer, &frames).await {
                        break LinkExit::Lost(e.to_string());
                    }
                }
                None => break LinkExit::Closed,
            },
        }
    };
    reader_task.abort();
    exit
}
