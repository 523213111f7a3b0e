//! Proxy transport: one router serving direct peers and broker peers.
//!
//! Direct peers connect over TCP exactly as with [`DirectTransport`]. The
//! first time a direct peer speaks, its routing key `<instance>.<peer>` is
//! bound to the proxy's outbound queue so broker agents can address it, and
//! the upstream broker router is told about it with `peerlist add`. When the
//! connection goes away the binding is removed and `peerlist drop` is sent.
//!
//! Outbound frames go to the direct side when the destination holds a direct
//! connection and are published to the broker otherwise.

use super::broker::{
    decode_vip, encode_vip, routing_key, Broker, BrokerSink, Delivery, QueueConsumer,
};
use super::direct::{DirectOptions, DirectSink, DirectTransport};
use super::{FrameSink, Transport, TransportEvent};
use crate::auth::CredentialStore;
use crate::config::{MessageBus, RouterConfig};
use crate::error::{DeliveryError, RouterResult};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use vipbus_wire::{Frame, PROTO};

/// Sends to direct peers directly and to everyone else through the broker.
pub struct ProxySink {
    direct: Arc<DirectSink>,
    broker: BrokerSink,
}

impl ProxySink {
    fn is_direct(&self, peer: &str) -> bool {
        self.direct.contains(peer)
    }
}

impl FrameSink for ProxySink {
    fn send_frames(&self, frames: Vec<Frame>) -> Result<(), DeliveryError> {
        match frames.first().and_then(|f| f.to_str()) {
            Some(dest) if self.is_direct(dest) => self.direct.send_frames(frames),
            _ => self.broker.send_frames(frames),
        }
    }

    fn bus_kind(&self, peer: &str) -> MessageBus {
        if self.is_direct(peer) {
            MessageBus::Direct
        } else {
            MessageBus::Broker
        }
    }

    fn close_peer(&self, peer: &str) {
        self.direct.close_peer(peer);
    }
}

/// Direct listener plus the proxy's broker queues.
pub struct ProxyTransport {
    direct: DirectTransport,
    sink: Arc<ProxySink>,
    broker: Broker,
    instance: String,
    identity: String,
    upstream: String,
    /// Messages addressed to the proxy itself.
    queue: QueueConsumer,
    /// Broker messages addressed to direct peers.
    outbound: QueueConsumer,
    bound: HashSet<String>,
}

impl ProxyTransport {
    /// Bind the direct listener and declare the proxy's queues.
    pub async fn bind(
        config: &RouterConfig,
        broker: &Broker,
        credentials: Arc<CredentialStore>,
    ) -> RouterResult<Self> {
        let direct = DirectTransport::bind(
            &config.bind_addresses,
            DirectOptions::from_config(config),
            credentials,
        )
        .await?;

        let instance = config.instance_name.clone();
        let identity = config.proxy_identity.clone();
        let queue_name = routing_key(&instance, &identity);
        let queue = broker.declare_queue(&queue_name)?;
        broker.bind(&queue_name, &queue_name)?;
        let outbound = broker.declare_queue(&config.proxy.outbound_queue)?;
        info!(
            queue = %queue_name,
            outbound = %config.proxy.outbound_queue,
            "VIP: proxy consuming from broker"
        );

        let sink = Arc::new(ProxySink {
            direct: direct.direct_sink(),
            broker: BrokerSink::new(broker.clone(), instance.as_str()),
        });
        Ok(Self {
            direct,
            sink,
            broker: broker.clone(),
            instance,
            identity,
            upstream: config.proxy.upstream_router.clone(),
            queue,
            outbound,
            bound: HashSet::new(),
        })
    }

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.direct.local_addr()
    }

    /// Direct peers currently reachable from the broker.
    pub fn bridged_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.bound.iter().cloned().collect();
        peers.sort();
        peers
    }

    fn from_broker(&self, delivery: &Delivery) -> Option<TransportEvent> {
        let mut frames = decode_vip(&self.instance, delivery);
        if frames[1] == self.identity.as_str() {
            let from_upstream = frames[0].is_empty() || frames[0] == self.upstream.as_str();
            if from_upstream && frames[5] == "peerlist" {
                debug!("VIP: ignoring upstream peerlist notification");
                return None;
            }
            frames[1] = Frame::empty();
        }
        Some(TransportEvent::Inbound {
            frames,
            credential: delivery.properties.user_id.clone(),
        })
    }

    /// Tell the upstream router about a direct peer.
    fn notify_upstream(&self, op: &str, peer: &str) {
        let frames = vec![
            Frame::text(self.upstream.as_str()),
            Frame::text(self.identity.as_str()),
            Frame::text(PROTO),
            Frame::empty(),
            Frame::empty(),
            Frame::text("peerlist"),
            Frame::text(op),
            Frame::text(peer),
        ];
        let Some((key, properties, body)) = encode_vip(&self.instance, &frames) else {
            return;
        };
        if let Err(e) = self.broker.publish(&key, properties, body, false) {
            warn!(peer, op, error = %e, "VIP: upstream router not notified");
        }
    }

    fn observe(&mut self, event: &TransportEvent) {
        match event {
            TransportEvent::Inbound { frames, .. } => {
                let Some(peer) = frames.first().and_then(|f| f.to_str()) else {
                    return;
                };
                if !self.sink.is_direct(peer) || self.bound.contains(peer) {
                    return;
                }
                let key = routing_key(&self.instance, peer);
                if let Err(e) = self.broker.bind(self.outbound.name(), &key) {
                    warn!(peer, error = %e, "VIP: could not bridge direct peer");
                    return;
                }
                self.bound.insert(peer.to_string());
                debug!(peer, "VIP: direct peer bridged to broker");
                self.notify_upstream("add", peer);
            }
            TransportEvent::Disconnected { peer } => {
                if self.bound.remove(peer) {
                    let key = routing_key(&self.instance, peer);
                    self.broker.unbind(self.outbound.name(), &key);
                    debug!(peer = %peer, "VIP: direct peer unbridged");
                    self.notify_upstream("drop", peer);
                }
            }
            TransportEvent::Undeliverable { .. } => {}
        }
    }
}

#[async_trait]
impl Transport for ProxyTransport {
    fn sink(&self) -> Arc<dyn FrameSink> {
        self.sink.clone()
    }

    fn local_addresses(&self) -> Vec<String> {
        self.direct.local_addresses()
    }

    async fn recv(&mut self) -> Option<TransportEvent> {
        loop {
            let event = tokio::select! {
                event = self.direct.recv() => event?,
                delivery = self.queue.next() => match self.from_broker(&delivery?) {
                    Some(event) => event,
                    None => continue,
                },
                delivery = self.outbound.next() => match self.from_broker(&delivery?) {
                    Some(event) => event,
                    None => continue,
                },
            };
            self.observe(&event);
            return Some(event);
        }
    }

    async fn close(&mut self) {
        for peer in std::mem::take(&mut self.bound) {
            self.broker.unbind(self.outbound.name(), &routing_key(&self.instance, &peer));
            self.notify_upstream("drop", &peer);
        }
        self.direct.close().await;
        self.queue.close();
        self.outbound.close();
    }
}
