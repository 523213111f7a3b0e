//! Direct transport: agents hold TCP connections to the router.
//!
//! Every connection starts with the greeting handshake, which fixes the
//! connection's identity for its lifetime. Inbound messages are prefixed with
//! that identity; outbound messages are queued on a bounded per-connection
//! channel so a slow peer surfaces as "would block" rather than stalling the
//! router loop.

use super::{destination, FrameSink, Transport, TransportEvent};
use crate::auth::CredentialStore;
use crate::config::{MessageBus, RouterConfig};
use crate::error::{DeliveryError, RouterError, RouterResult};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use vipbus_wire::handshake::{read_greeting, write_ack};
use vipbus_wire::stream::{read_multipart, write_multipart};
use vipbus_wire::{Frame, FramedStream, GreetingAck, WireError};

/// Direct transport settings.
#[derive(Debug, Clone)]
pub struct DirectOptions {
    pub allow_anonymous: bool,
    /// Outbound messages buffered per connection.
    pub queue_depth: usize,
    pub handshake_timeout: Duration,
}

impl Default for DirectOptions {
    fn default() -> Self {
        Self {
            allow_anonymous: true,
            queue_depth: 1024,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl DirectOptions {
    pub fn from_config(config: &RouterConfig) -> Self {
        Self {
            allow_anonymous: config.allow_anonymous,
            queue_depth: config.send_queue_depth.max(1),
            ..Self::default()
        }
    }
}

struct Connection {
    id: u64,
    tx: mpsc::Sender<Vec<Frame>>,
    shutdown: Arc<Notify>,
}

/// Outbound half of the direct transport.
#[derive(Default)]
pub struct DirectSink {
    conns: DashMap<String, Connection>,
    next_id: AtomicU64,
}

impl DirectSink {
    /// Whether `peer` currently has a connection.
    pub fn contains(&self, peer: &str) -> bool {
        self.conns.contains_key(peer)
    }

    pub fn connected(&self) -> Vec<String> {
        self.conns.iter().map(|e| e.key().clone()).collect()
    }

    /// Remove `identity` only if it still belongs to connection `id`.
    fn release(&self, identity: &str, id: u64) -> bool {
        self.conns.remove_if(identity, |_, c| c.id == id).is_some()
    }
}

impl FrameSink for DirectSink {
    fn send_frames(&self, mut frames: Vec<Frame>) -> Result<(), DeliveryError> {
        let dest = destination(&frames).ok_or(DeliveryError::Unreachable)?;
        let conn = self.conns.get(&dest).ok_or(DeliveryError::Unreachable)?;
        frames.remove(0);
        conn.tx.try_send(frames).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::WouldBlock,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Unreachable,
        })
    }

    fn bus_kind(&self, _peer: &str) -> MessageBus {
        MessageBus::Direct
    }

    fn close_peer(&self, peer: &str) {
        if let Some((_, conn)) = self.conns.remove(peer) {
            debug!(peer, "VIP: closing connection");
            conn.shutdown.notify_one();
        }
    }
}

struct Shared {
    sink: Arc<DirectSink>,
    events: mpsc::Sender<TransportEvent>,
    credentials: Arc<CredentialStore>,
    options: DirectOptions,
}

/// TCP listener(s) plus the connections they accepted.
pub struct DirectTransport {
    local_addrs: Vec<SocketAddr>,
    sink: Arc<DirectSink>,
    events: mpsc::Receiver<TransportEvent>,
    accept_tasks: Vec<JoinHandle<()>>,
}

impl DirectTransport {
    /// Bind every address and start accepting connections.
    pub async fn bind(
        addrs: &[String],
        options: DirectOptions,
        credentials: Arc<CredentialStore>,
    ) -> RouterResult<Self> {
        if addrs.is_empty() {
            return Err(RouterError::Config("no bind addresses configured".into()));
        }
        let (events_tx, events) = mpsc::channel(4096);
        let sink = Arc::new(DirectSink::default());
        let shared = Arc::new(Shared {
            sink: Arc::clone(&sink),
            events: events_tx,
            credentials,
            options,
        });

        let mut local_addrs = Vec::with_capacity(addrs.len());
        let mut accept_tasks = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let listener = TcpListener::bind(addr.as_str())
                .await
                .map_err(|source| RouterError::Bind {
                    addr: addr.clone(),
                    source,
                })?;
            let local = listener.local_addr().map_err(|source| RouterError::Bind {
                addr: addr.clone(),
                source,
            })?;
            info!("VIP: listening on {}", local);
            local_addrs.push(local);
            let shared = Arc::clone(&shared);
            accept_tasks.push(tokio::spawn(accept_loop(listener, shared)));
        }

        Ok(Self {
            local_addrs,
            sink,
            events,
            accept_tasks,
        })
    }

    /// The first bound address.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addrs.first().copied()
    }

    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn direct_sink(&self) -> Arc<DirectSink> {
        Arc::clone(&self.sink)
    }
}

#[async_trait]
impl Transport for DirectTransport {
    fn sink(&self) -> Arc<dyn FrameSink> {
        self.sink.clone()
    }

    fn local_addresses(&self) -> Vec<String> {
        self.local_addrs.iter().map(|a| a.to_string()).collect()
    }

    async fn recv(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }

    async fn close(&mut self) {
        for task in self.accept_tasks.drain(..) {
            task.abort();
        }
        for peer in self.sink.connected() {
            self.sink.close_peer(&peer);
        }
        self.events.close();
    }
}

impl Drop for DirectTransport {
    fn drop(&mut self) {
        for task in &self.accept_tasks {
            task.abort();
        }
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!("VIP: accepted connection from {}", addr);
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, addr, &shared).await {
                        debug!("VIP: connection from {} ended: {}", addr, e);
                    }
                });
            }
            Err(e) => {
                error!("VIP: accept error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn reject(
    channel: &mut FramedStream<TcpStream>,
    reason: &str,
) -> Result<(), WireError> {
    write_ack(channel, &GreetingAck::reject(reason)).await?;
    Err(WireError::HandshakeFailed(reason.to_string()))
}

/// Handshake, then pump frames until either side goes away.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    shared: &Shared,
) -> Result<(), WireError> {
    stream.set_nodelay(true)?;
    let mut channel = FramedStream::new(stream);

    let greeting = tokio::time::timeout(shared.options.handshake_timeout, read_greeting(&mut channel))
        .await
        .map_err(|_| WireError::HandshakeFailed("handshake timed out".into()))??;

    let key_id = match &greeting.key_id {
        Some(key) => match shared.credentials.secret(key) {
            Some(secret) if greeting.verify(&secret) => Some(key.clone()),
            _ => {
                warn!(key_id = %key, %addr, "VIP: credential verification failed");
                return reject(&mut channel, "authentication failed").await;
            }
        },
        None if shared.options.allow_anonymous => None,
        None => return reject(&mut channel, "credentials required").await,
    };

    let identity = if greeting.identity.trim().is_empty() {
        uuid::Uuid::new_v4().to_string()
    } else {
        greeting.identity.clone()
    };

    let id = shared.sink.next_id.fetch_add(1, Ordering::Relaxed);
    let (tx, mut rx) = mpsc::channel::<Vec<Frame>>(shared.options.queue_depth);
    let shutdown = Arc::new(Notify::new());
    let inserted = match shared.sink.conns.entry(identity.clone()) {
        Entry::Occupied(_) => false,
        Entry::Vacant(slot) => {
            slot.insert(Connection {
                id,
                tx,
                shutdown: Arc::clone(&shutdown),
            });
            true
        }
    };
    if !inserted {
        warn!(peer = %identity, %addr, "VIP: identity already connected");
        return reject(&mut channel, "identity in use").await;
    }

    if let Err(e) = write_ack(&mut channel, &GreetingAck::accept(&identity)).await {
        shared.sink.release(&identity, id);
        return Err(e);
    }
    if let Some(key) = &key_id {
        shared.credentials.record_login(&identity, key);
    }
    info!(peer = %identity, %addr, "VIP: peer connected");

    let (mut reader, mut writer) = channel.into_inner().into_split();
    let writer_task = tokio::spawn(async move {
        while let Some(frames) = rx.recv().await {
            if let Err(e) = write_multipart(&mut writer, &frames).await {
                debug!("VIP: write failed: {}", e);
                break;
            }
        }
    });

    let result = loop {
        let frames = tokio::select! {
            _ = shutdown.notified() => break Ok(()),
            read = read_multipart(&mut reader) => match read {
                Ok(frames) => frames,
                Err(WireError::ConnectionClosed) => break Ok(()),
                Err(e) => break Err(e),
            },
        };
        let mut routed = Vec::with_capacity(frames.len() + 1);
        routed.push(Frame::text(identity.as_str()));
        routed.extend(frames);
        let event = TransportEvent::Inbound {
            frames: routed,
            credential: key_id.clone(),
        };
        if shared.events.send(event).await.is_err() {
            break Ok(());
        }
    };

    writer_task.abort();
    if shared.sink.release(&identity, id) {
        shared.credentials.forget_login(&identity);
        info!(peer = %identity, "VIP: peer disconnected");
        let _ = shared
            .events
            .send(TransportEvent::Disconnected { peer: identity })
            .await;
    }
    result
}
