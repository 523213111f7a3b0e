//! Broker-mediated transport.
//!
//! An in-process topic exchange with AMQP semantics: queues are bound to
//! routing-key patterns where `*` matches one dot-separated word and `#`
//! matches zero or more. Each VIP identity consumes from the queue
//! `<instance>.<identity>`, bound to the routing key of the same name.
//!
//! A VIP message maps onto a broker message as follows:
//!
//! | VIP frame  | broker field                          |
//! |------------|---------------------------------------|
//! | recipient  | routing key `<instance>.<recipient>`  |
//! | sender     | `app_id` = `<instance>.<sender>`, header `sender` |
//! | user id    | header `userid`                       |
//! | message id | `message_id`                          |
//! | subsystem  | `type`                                |
//! | args       | body, the argument frames in multipart encoding |
//!
//! Argument frames keep their kind tags, so typed values survive the broker.
//! Bodies published as `application/json` (a JSON array of strings) are
//! still accepted from agents that do not tag their frames.

use super::{FrameSink, Transport, TransportEvent};
use crate::config::MessageBus;
use crate::error::DeliveryError;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use vipbus_wire::stream::{decode_multipart, encode_multipart, MultipartChannel};
use vipbus_wire::{Frame, WireError, PROTO};

/// Content type of bodies carrying tagged argument frames.
pub const FRAMES_CONTENT_TYPE: &str = "application/x-vip-frames";

/// Default number of messages a queue holds before publishes are refused.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("queue {0:?} already exists")]
    QueueExists(String),
    #[error("no such queue {0:?}")]
    NoSuchQueue(String),
    #[error("no queue bound for routing key {0:?}")]
    Unroutable(String),
    #[error("queue {0:?} is full")]
    QueueFull(String),
}

/// Message properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    pub app_id: String,
    pub message_id: String,
    /// AMQP `type`.
    pub kind: String,
    /// Authenticated user of the publishing connection.
    pub user_id: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub content_type: Option<String>,
}

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub routing_key: String,
    pub properties: Properties,
    pub body: Bytes,
}

/// Whether a routing key matches a binding pattern.
pub fn topic_matches(pattern: &str, key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && match_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && match_words(rest, &key[1..]),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    queue: String,
    pattern: String,
}

struct BrokerInner {
    exchange: String,
    capacity: usize,
    queues: DashMap<String, mpsc::Sender<Delivery>>,
    bindings: RwLock<Vec<Binding>>,
    alternate: RwLock<Option<String>>,
}

/// Handle to a topic exchange. Cheap to clone.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("exchange", &self.inner.exchange)
            .field("queues", &self.inner.queues.len())
            .finish()
    }
}

impl Broker {
    pub fn new(exchange: impl Into<String>) -> Self {
        Self::with_capacity(exchange, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(exchange: impl Into<String>, capacity: usize) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                exchange: exchange.into(),
                capacity: capacity.max(1),
                queues: DashMap::new(),
                bindings: RwLock::new(Vec::new()),
                alternate: RwLock::new(None),
            }),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.inner.exchange
    }

    /// Declare an exclusive queue. It is deleted when the consumer drops.
    pub fn declare_queue(&self, name: &str) -> Result<QueueConsumer, BrokerError> {
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        match self.inner.queues.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(BrokerError::QueueExists(name.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }
        debug!(queue = name, exchange = %self.inner.exchange, "Broker: queue declared");
        Ok(QueueConsumer {
            name: name.to_string(),
            rx,
            broker: self.clone(),
        })
    }

    /// Delete a queue and its bindings.
    pub fn delete_queue(&self, name: &str) {
        self.inner.queues.remove(name);
        let mut bindings = self.inner.bindings.write().unwrap_or_else(|e| e.into_inner());
        bindings.retain(|b| b.queue != name);
        let mut alternate = self.inner.alternate.write().unwrap_or_else(|e| e.into_inner());
        if alternate.as_deref() == Some(name) {
            *alternate = None;
        }
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.inner.queues.contains_key(name)
    }

    /// Bind `queue` to a routing-key pattern. Binding twice is a no-op.
    pub fn bind(&self, queue: &str, pattern: &str) -> Result<(), BrokerError> {
        if !self.has_queue(queue) {
            return Err(BrokerError::NoSuchQueue(queue.to_string()));
        }
        let binding = Binding {
            queue: queue.to_string(),
            pattern: pattern.to_string(),
        };
        let mut bindings = self.inner.bindings.write().unwrap_or_else(|e| e.into_inner());
        if !bindings.contains(&binding) {
            bindings.push(binding);
        }
        Ok(())
    }

    pub fn unbind(&self, queue: &str, pattern: &str) {
        let mut bindings = self.inner.bindings.write().unwrap_or_else(|e| e.into_inner());
        bindings.retain(|b| !(b.queue == queue && b.pattern == pattern));
    }

    /// Route messages that match no binding to `queue`.
    pub fn set_alternate(&self, queue: Option<&str>) {
        let mut alternate = self.inner.alternate.write().unwrap_or_else(|e| e.into_inner());
        *alternate = queue.map(str::to_string);
    }

    fn matching_queues(&self, routing_key: &str) -> BTreeSet<String> {
        let bindings = self.inner.bindings.read().unwrap_or_else(|e| e.into_inner());
        bindings
            .iter()
            .filter(|b| topic_matches(&b.pattern, routing_key))
            .map(|b| b.queue.clone())
            .collect()
    }

    /// Publish a message; returns the number of queues it reached.
    ///
    /// A `mandatory` publish that matches no queue fails with
    /// [`BrokerError::Unroutable`]; otherwise it goes to the alternate queue
    /// if one is set, or is discarded.
    pub fn publish(
        &self,
        routing_key: &str,
        properties: Properties,
        body: Bytes,
        mandatory: bool,
    ) -> Result<usize, BrokerError> {
        let delivery = Delivery {
            routing_key: routing_key.to_string(),
            properties,
            body,
        };
        let mut delivered = 0;
        let mut full = None;
        for queue in self.matching_queues(routing_key) {
            let Some(tx) = self.inner.queues.get(&queue).map(|q| q.clone()) else {
                continue;
            };
            match tx.try_send(delivery.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => full = Some(queue),
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }

        if delivered > 0 {
            return Ok(delivered);
        }
        if let Some(queue) = full {
            return Err(BrokerError::QueueFull(queue));
        }
        if mandatory {
            return Err(BrokerError::Unroutable(routing_key.to_string()));
        }
        let alternate = self
            .inner
            .alternate
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(queue) = alternate {
            if let Some(tx) = self.inner.queues.get(&queue).map(|q| q.clone()) {
                if tx.try_send(delivery).is_err() {
                    warn!(queue = %queue, "Broker: alternate queue rejected message");
                }
            }
        } else {
            debug!(routing_key, "Broker: discarding unroutable message");
        }
        Ok(0)
    }
}

/// The consuming end of a queue.
pub struct QueueConsumer {
    name: String,
    rx: mpsc::Receiver<Delivery>,
    broker: Broker,
}

impl QueueConsumer {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn next(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<Delivery> {
        self.rx.try_recv().ok()
    }

    /// Stop accepting deliveries; buffered ones can still be drained.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

impl Drop for QueueConsumer {
    fn drop(&mut self) {
        self.broker.delete_queue(&self.name);
    }
}

/// Routing key for `identity` on `instance`.
pub fn routing_key(instance: &str, identity: &str) -> String {
    format!("{instance}.{identity}")
}

fn strip_instance<'a>(instance: &str, key: &'a str) -> &'a str {
    key.strip_prefix(instance)
        .and_then(|rest| rest.strip_prefix('.'))
        .unwrap_or(key)
}

/// Convert router-order frames `[dest, sender, VIP1, user_id, msg_id,
/// subsystem, args...]` into a routing key, properties and body.
pub fn encode_vip(instance: &str, frames: &[Frame]) -> Option<(String, Properties, Bytes)> {
    if frames.len() < 6 {
        return None;
    }
    let text = |i: usize| frames[i].to_string_lossy().into_owned();
    let dest = text(0);
    let sender = text(1);
    let body = match encode_multipart(&frames[6..]) {
        // Drop the stream length header; the broker delimits messages itself.
        Ok(packed) => Bytes::from(packed).slice(4..),
        Err(e) => {
            warn!(sender = %sender, error = %e, "Broker: arguments not encodable");
            return None;
        }
    };

    let mut headers = BTreeMap::new();
    headers.insert("sender".to_string(), sender.clone());
    headers.insert("recipient".to_string(), dest.clone());
    headers.insert("proto".to_string(), text(2));
    headers.insert("userid".to_string(), text(3));
    let properties = Properties {
        app_id: routing_key(instance, &sender),
        message_id: text(4),
        kind: text(5),
        user_id: None,
        headers,
        content_type: Some(FRAMES_CONTENT_TYPE.to_string()),
    };
    Some((routing_key(instance, &dest), properties, body))
}

/// Convert a delivery into inbound order `[sender, recipient, VIP1,
/// user_id, msg_id, subsystem, args...]`.
pub fn decode_vip(instance: &str, delivery: &Delivery) -> Vec<Frame> {
    let props = &delivery.properties;
    let header = |name: &str| props.headers.get(name).cloned();
    let sender = header("sender")
        .unwrap_or_else(|| strip_instance(instance, &props.app_id).to_string());
    let recipient = header("recipient")
        .unwrap_or_else(|| strip_instance(instance, &delivery.routing_key).to_string());
    let args = decode_args(props.content_type.as_deref(), &delivery.body);

    let mut frames = Vec::with_capacity(6 + args.len());
    frames.push(Frame::text(sender));
    frames.push(Frame::text(recipient));
    frames.push(Frame::text(PROTO));
    frames.push(Frame::text(header("userid").unwrap_or_default()));
    frames.push(Frame::text(props.message_id.as_str()));
    frames.push(Frame::text(props.kind.as_str()));
    frames.extend(args);
    frames
}

fn decode_args(content_type: Option<&str>, body: &[u8]) -> Vec<Frame> {
    if content_type == Some(FRAMES_CONTENT_TYPE) {
        return decode_multipart(body).unwrap_or_else(|e| {
            warn!(error = %e, "Broker: malformed argument frames");
            Vec::new()
        });
    }
    match serde_json::from_slice::<Vec<String>>(body) {
        Ok(args) => args.into_iter().map(Frame::text).collect(),
        Err(e) => {
            warn!(error = %e, "Broker: message body is not a JSON string list");
            Vec::new()
        }
    }
}

/// Outbound half of the broker transport.
pub struct BrokerSink {
    broker: Broker,
    instance: String,
}

impl BrokerSink {
    pub fn new(broker: Broker, instance: impl Into<String>) -> Self {
        Self {
            broker,
            instance: instance.into(),
        }
    }
}

impl FrameSink for BrokerSink {
    fn send_frames(&self, frames: Vec<Frame>) -> Result<(), DeliveryError> {
        let (key, properties, body) =
            encode_vip(&self.instance, &frames).ok_or(DeliveryError::Unreachable)?;
        match self.broker.publish(&key, properties, body, true) {
            Ok(_) => Ok(()),
            Err(BrokerError::QueueFull(_)) => Err(DeliveryError::WouldBlock),
            Err(e) => {
                debug!(error = %e, "Broker: delivery failed");
                Err(DeliveryError::Unreachable)
            }
        }
    }

    fn bus_kind(&self, _peer: &str) -> MessageBus {
        MessageBus::Broker
    }

    fn close_peer(&self, peer: &str) {
        debug!(peer, "Broker: peers own their queues; nothing to close");
    }
}

/// Router side of the broker transport.
pub struct BrokerTransport {
    sink: Arc<BrokerSink>,
    instance: String,
    identity: String,
    queue: QueueConsumer,
    unroutable: QueueConsumer,
}

impl BrokerTransport {
    /// Declare the router's queue and the unroutable queue.
    pub fn bind(broker: &Broker, instance: &str, identity: &str) -> Result<Self, BrokerError> {
        let name = routing_key(instance, identity);
        let queue = broker.declare_queue(&name)?;
        broker.bind(&name, &name)?;

        let unroutable_name = routing_key(instance, "unroutable");
        let unroutable = broker.declare_queue(&unroutable_name)?;
        broker.set_alternate(Some(&unroutable_name));
        info!(queue = %name, exchange = %broker.exchange(), "VIP: consuming from broker");

        Ok(Self {
            sink: Arc::new(BrokerSink::new(broker.clone(), instance)),
            instance: instance.to_string(),
            identity: identity.to_string(),
            queue,
            unroutable,
        })
    }

    pub fn broker_sink(&self) -> Arc<BrokerSink> {
        Arc::clone(&self.sink)
    }

    /// Convert a delivery from the router queue into an inbound event.
    pub(crate) fn inbound(&self, delivery: &Delivery) -> TransportEvent {
        let mut frames = decode_vip(&self.instance, delivery);
        if frames[1] == self.identity.as_str() {
            frames[1] = Frame::empty();
        }
        TransportEvent::Inbound {
            frames,
            credential: delivery.properties.user_id.clone(),
        }
    }

    /// Convert an unroutable delivery into router order.
    pub(crate) fn undeliverable(&self, delivery: &Delivery) -> TransportEvent {
        let mut frames = decode_vip(&self.instance, delivery);
        frames.swap(0, 1);
        TransportEvent::Undeliverable { frames }
    }
}

#[async_trait]
impl Transport for BrokerTransport {
    fn sink(&self) -> Arc<dyn FrameSink> {
        self.sink.clone()
    }

    async fn recv(&mut self) -> Option<TransportEvent> {
        tokio::select! {
            delivery = self.queue.next() => delivery.map(|d| self.inbound(&d)),
            delivery = self.unroutable.next() => delivery.map(|d| self.undeliverable(&d)),
        }
    }

    async fn close(&mut self) {
        self.queue.close();
        self.unroutable.close();
    }
}

/// Agent side of the broker transport.
///
/// Speaks dealer-order multipart messages, so it can carry a
/// [`vipbus_wire::VipSocket`].
pub struct BrokerConnection {
    broker: Broker,
    instance: String,
    identity: String,
    router_identity: String,
    user_id: Option<String>,
    queue: QueueConsumer,
}

impl BrokerConnection {
    /// Declare and bind `<instance>.<identity>`.
    pub fn connect(
        broker: &Broker,
        instance: &str,
        identity: &str,
        router_identity: &str,
    ) -> Result<Self, BrokerError> {
        let name = routing_key(instance, identity);
        let queue = broker.declare_queue(&name)?;
        broker.bind(&name, &name)?;
        Ok(Self {
            broker: broker.clone(),
            instance: instance.to_string(),
            identity: identity.to_string(),
            router_identity: router_identity.to_string(),
            user_id: None,
            queue,
        })
    }

    /// Publish as an authenticated broker user.
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }
}

#[async_trait]
impl MultipartChannel for BrokerConnection {
    async fn send_multipart(&mut self, frames: Vec<Frame>) -> Result<(), WireError> {
        if frames.len() < 5 {
            return Err(WireError::Malformed(format!(
                "expected at least 5 frames, got {}",
                frames.len()
            )));
        }
        let peer = if frames[0].is_empty() {
            Frame::text(self.router_identity.as_str())
        } else {
            frames[0].clone()
        };
        let mut routed = Vec::with_capacity(frames.len() + 1);
        routed.push(peer);
        routed.push(Frame::text(self.identity.as_str()));
        routed.extend(frames.into_iter().skip(1));

        let (key, mut properties, body) = encode_vip(&self.instance, &routed)
            .ok_or_else(|| WireError::Malformed("short message".into()))?;
        properties.user_id = self.user_id.clone();
        self.broker
            .publish(&key, properties, body, false)
            .map(|_| ())
            .map_err(|e| WireError::Io(std::io::Error::new(std::io::ErrorKind::WouldBlock, e)))
    }

    async fn recv_multipart(&mut self) -> Result<Vec<Frame>, WireError> {
        let delivery = self.queue.next().await.ok_or(WireError::ConnectionClosed)?;
        let mut frames = decode_vip(&self.instance, &delivery);
        frames.remove(1);
        if frames[0] == self.router_identity.as_str() {
            frames[0] = Frame::empty();
        }
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vipbus_wire::{frames, FrameKind};

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("site.hvac", "site.hvac"));
        assert!(!topic_matches("site.hvac", "site.hvac.1"));
        assert!(topic_matches("site.*", "site.hvac"));
        assert!(!topic_matches("site.*", "site"));
        assert!(!topic_matches("site.*", "site.hvac.1"));
        assert!(topic_matches("site.#", "site"));
        assert!(topic_matches("site.#", "site.hvac.1"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("*.hvac.#", "site.hvac"));
        assert!(!topic_matches("*.hvac.#", "site.meter.hvac"));
        assert!(topic_matches("#.zone", "a.b.zone"));
    }

    #[tokio::test]
    async fn test_publish_to_bound_queues() {
        let broker = Broker::new("volttron");
        let mut a = broker.declare_queue("a").unwrap();
        let mut b = broker.declare_queue("b").unwrap();
        broker.bind("a", "site.*").unwrap();
        broker.bind("b", "site.hvac").unwrap();
        broker.bind("b", "site.hvac").unwrap();

        let n = broker
            .publish("site.hvac", Properties::default(), Bytes::from_static(b"[]"), true)
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(a.next().await.unwrap().routing_key, "site.hvac");
        assert_eq!(b.next().await.unwrap().routing_key, "site.hvac");
        assert!(b.try_next().is_none());
    }

    #[test]
    fn test_mandatory_and_alternate() {
        let broker = Broker::new("volttron");
        assert_eq!(
            broker.publish("nowhere", Properties::default(), Bytes::new(), true),
            Err(BrokerError::Unroutable("nowhere".into()))
        );

        let mut dead = broker.declare_queue("dead").unwrap();
        broker.set_alternate(Some("dead"));
        assert_eq!(
            broker.publish("nowhere", Properties::default(), Bytes::new(), false),
            Ok(0)
        );
        assert_eq!(dead.try_next().unwrap().routing_key, "nowhere");
    }

    #[test]
    fn test_full_queue_and_drop() {
        let broker = Broker::with_capacity("volttron", 1);
        let q = broker.declare_queue("q").unwrap();
        broker.bind("q", "q").unwrap();
        assert!(broker.publish("q", Properties::default(), Bytes::new(), true).is_ok());
        assert_eq!(
            broker.publish("q", Properties::default(), Bytes::new(), true),
            Err(BrokerError::QueueFull("q".into()))
        );
        assert!(matches!(
            broker.declare_queue("q"),
            Err(BrokerError::QueueExists(_))
        ));
        drop(q);
        assert!(!broker.has_queue("q"));
        assert!(matches!(
            broker.publish("q", Properties::default(), Bytes::new(), true),
            Err(BrokerError::Unroutable(_))
        ));
    }

    #[test]
    fn test_vip_mapping() {
        let outbound = frames(&["hvac", "meter", PROTO, "admin", "m1", "rpc", "[1]", "x"]);
        let (key, props, body) = encode_vip("site", &outbound).unwrap();
        assert_eq!(key, "site.hvac");
        assert_eq!(props.app_id, "site.meter");
        assert_eq!(props.kind, "rpc");
        assert_eq!(props.message_id, "m1");
        assert_eq!(props.headers["userid"], "admin");

        let delivery = Delivery {
            routing_key: key,
            properties: props,
            body,
        };
        let inbound = decode_vip("site", &delivery);
        assert_eq!(
            inbound,
            frames(&["meter", "hvac", PROTO, "admin", "m1", "rpc", "[1]", "x"])
        );
    }

    #[test]
    fn test_typed_arguments_keep_their_kind() {
        let mut outbound = frames(&["hvac", "meter", PROTO, "", "m1", "rpc"]);
        outbound.push(Frame::new(FrameKind::Int, Bytes::copy_from_slice(&7i64.to_be_bytes())));
        outbound.push(Frame::raw(Bytes::from_static(&[0xff, 0x00])));
        outbound.push(Frame::empty());
        let (key, props, body) = encode_vip("site", &outbound).unwrap();
        assert_eq!(props.content_type.as_deref(), Some(FRAMES_CONTENT_TYPE));

        let inbound = decode_vip(
            "site",
            &Delivery {
                routing_key: key,
                properties: props,
                body,
            },
        );
        assert_eq!(inbound[6..], outbound[6..]);
        let kinds: Vec<FrameKind> = inbound[6..].iter().map(Frame::kind).collect();
        assert_eq!(kinds, vec![FrameKind::Int, FrameKind::Raw, FrameKind::Raw]);
    }

    #[test]
    fn test_json_string_bodies_still_accepted() {
        let delivery = Delivery {
            routing_key: "site.hvac".into(),
            properties: Properties {
                app_id: "site.meter".into(),
                message_id: "m2".into(),
                kind: "echo".into(),
                content_type: Some("application/json".into()),
                ..Properties::default()
            },
            body: Bytes::from_static(br#"["hi", "there"]"#),
        };
        assert_eq!(
            decode_vip("site", &delivery),
            frames(&["meter", "hvac", PROTO, "", "m2", "echo", "hi", "there"])
        );
    }

    #[tokio::test]
    async fn test_connection_round_trip_through_router_queue() {
        let broker = Broker::new("volttron");
        let mut transport = BrokerTransport::bind(&broker, "site", "router").unwrap();
        let mut agent = BrokerConnection::connect(&broker, "site", "hvac", "router")
            .unwrap()
            .with_user_id("hvac-key");

        agent
            .send_multipart(frames(&["", PROTO, "", "m1", "ping"]))
            .await
            .unwrap();
        match transport.recv().await.unwrap() {
            TransportEvent::Inbound { frames: got, credential } => {
                assert_eq!(got, frames(&["hvac", "", PROTO, "", "m1", "ping"]));
                assert_eq!(credential.as_deref(), Some("hvac-key"));
            }
            other => panic!("unexpected event {other:?}"),
        }

        transport
            .sink()
            .send_frames(frames(&["hvac", "", PROTO, "", "m1", "ping", "pong"]))
            .unwrap();
        let reply = agent.recv_multipart().await.unwrap();
        assert_eq!(reply, frames(&["", PROTO, "", "m1", "ping", "pong"]));
    }

    #[tokio::test]
    async fn test_unroutable_agent_message_reaches_router() {
        let broker = Broker::new("volttron");
        let mut transport = BrokerTransport::bind(&broker, "site", "router").unwrap();
        let mut agent = BrokerConnection::connect(&broker, "site", "hvac", "router").unwrap();

        agent
            .send_multipart(frames(&["ghost", PROTO, "", "m9", "echo", "hi"]))
            .await
            .unwrap();
        assert_eq!(
            transport.recv().await.unwrap(),
            TransportEvent::Undeliverable {
                frames: frames(&["ghost", "hvac", PROTO, "", "m9", "echo", "hi"])
            }
        );
        assert_eq!(
            transport
                .sink()
                .send_frames(frames(&["ghost", "hvac", PROTO, "", "m9", "echo"])),
            Err(DeliveryError::Unreachable)
        );
    }
}
