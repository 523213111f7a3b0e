//! Router service: the single task that owns the router.
//!
//! All router state is touched from [`RouterService::run`] only. Transport
//! events, federation link reports and [`RouterHandle`] requests are merged
//! with `tokio::select!` and handled one at a time.

use crate::auth::CredentialStore;
use crate::config::{PlatformConfig, RouterConfig};
use crate::error::{RouterError, RouterResult};
use crate::hooks::{Authenticator, PubSub};
use crate::router::{Flow, Router};
use crate::routing::{LinkEvent, PlatformInfo};
use crate::transport::broker::{Broker, BrokerTransport};
use crate::transport::direct::{DirectOptions, DirectTransport};
use crate::transport::proxy::ProxyTransport;
use crate::transport::{Transport, TransportEvent};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// A router serving direct peers and broker peers at once.
pub type ProxyRouter = RouterService<ProxyTransport>;

enum Command {
    Peers(oneshot::Sender<Vec<String>>),
    Platforms(oneshot::Sender<Vec<PlatformInfo>>),
    Connect(PlatformConfig),
    Disconnect(String, oneshot::Sender<bool>),
    Stop,
}

/// Cloneable control handle for a running router.
#[derive(Clone)]
pub struct RouterHandle {
    tx: mpsc::Sender<Command>,
}

impl RouterHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> RouterResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| RouterError::Stopped)?;
        reply_rx.await.map_err(|_| RouterError::Stopped)
    }

    /// Identities currently in the peer table.
    pub async fn peers(&self) -> RouterResult<Vec<String>> {
        self.request(Command::Peers).await
    }

    pub async fn platforms(&self) -> RouterResult<Vec<PlatformInfo>> {
        self.request(Command::Platforms).await
    }

    pub async fn connect_platform(&self, platform: PlatformConfig) -> RouterResult<()> {
        self.tx
            .send(Command::Connect(platform))
            .await
            .map_err(|_| RouterError::Stopped)
    }

    pub async fn disconnect_platform(&self, instance: &str) -> RouterResult<()> {
        let name = instance.to_string();
        if self.request(|reply| Command::Disconnect(name, reply)).await? {
            Ok(())
        } else {
            Err(RouterError::UnknownPlatform(instance.to_string()))
        }
    }

    /// Ask the router loop to exit.
    pub async fn stop(&self) -> RouterResult<()> {
        self.tx.send(Command::Stop).await.map_err(|_| RouterError::Stopped)
    }
}

/// A router bound to a transport.
pub struct RouterService<T: Transport> {
    router: Router,
    transport: T,
    link_rx: mpsc::UnboundedReceiver<LinkEvent>,
    commands_rx: mpsc::Receiver<Command>,
    commands_tx: mpsc::Sender<Command>,
}

impl<T: Transport> RouterService<T> {
    pub fn new(config: RouterConfig, transport: T, credentials: Arc<CredentialStore>) -> Self {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::channel(64);
        let mut router = Router::new(config, transport.sink(), credentials, link_tx);
        router.set_addresses(transport.local_addresses());
        Self {
            router,
            transport,
            link_rx,
            commands_rx,
            commands_tx,
        }
    }

    pub fn with_pubsub(mut self, pubsub: Box<dyn PubSub>) -> Self {
        self.router = self.router.with_pubsub(pubsub);
        self
    }

    pub fn with_authenticator(mut self, auth: Arc<dyn Authenticator>) -> Self {
        self.router = self.router.with_authenticator(auth);
        self
    }

    pub fn handle(&self) -> RouterHandle {
        RouterHandle {
            tx: self.commands_tx.clone(),
        }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Run until `quit`, a stop request, or the transport shutting down.
    pub async fn run(mut self) -> RouterResult<()> {
        let config = self.router.config();
        info!(
            instance = %config.instance_name,
            identity = %config.identity,
            bus = %config.message_bus,
            "VIP: router started"
        );
        for platform in config.platforms.clone() {
            self.router.connect_platform(platform);
        }

        loop {
            tokio::select! {
                event = self.transport.recv() => match event {
                    Some(TransportEvent::Inbound { frames, credential }) => {
                        if self.router.route(frames, credential.as_deref()) == Flow::Stop {
                            break;
                        }
                    }
                    Some(TransportEvent::Disconnected { peer }) => self.router.peer_disconnected(&peer),
                    Some(TransportEvent::Undeliverable { frames }) => self.router.undeliverable(frames),
                    None => {
                        warn!("VIP: transport closed");
                        break;
                    }
                },
                Some(event) = self.link_rx.recv() => self.router.handle_link_event(event),
                Some(command) = self.commands_rx.recv() => {
                    if self.handle_command(command) == Flow::Stop {
                        break;
                    }
                }
            }
        }

        self.router.shutdown();
        self.transport.close().await;
        info!("VIP: router stopped");
        Ok(())
    }

    fn handle_command(&mut self, command: Command) -> Flow {
        match command {
            Command::Peers(reply) => {
                let _ = reply.send(self.router.peers());
            }
            Command::Platforms(reply) => {
                let _ = reply.send(self.router.platforms());
            }
            Command::Connect(platform) => self.router.connect_platform(platform),
            Command::Disconnect(instance, reply) => {
                let _ = reply.send(self.router.disconnect_platform(&instance));
            }
            Command::Stop => {
                debug!("VIP: stop requested");
                return Flow::Stop;
            }
        }
        Flow::Continue
    }
}

impl RouterService<DirectTransport> {
    /// Bind the configured addresses and build a direct-transport router.
    pub async fn bind_direct(config: RouterConfig) -> RouterResult<Self> {
        let credentials = Arc::new(CredentialStore::from_config(&config.credentials));
        let transport = DirectTransport::bind(
            &config.bind_addresses,
            DirectOptions::from_config(&config),
            Arc::clone(&credentials),
        )
        .await?;
        Ok(Self::new(config, transport, credentials))
    }
}

impl RouterService<BrokerTransport> {
    /// Build a router consuming from `broker`.
    pub fn on_broker(config: RouterConfig, broker: &Broker) -> RouterResult<Self> {
        let credentials = Arc::new(CredentialStore::from_config(&config.credentials));
        let transport = BrokerTransport::bind(broker, &config.instance_name, &config.identity)?;
        Ok(Self::new(config, transport, credentials))
    }
}

impl RouterService<ProxyTransport> {
    /// Build a proxy router: direct listener on the configured addresses,
    /// broker side under the proxy identity.
    pub async fn bind_proxy(mut config: RouterConfig, broker: &Broker) -> RouterResult<Self> {
        config.identity = config.proxy_identity.clone();
        let credentials = Arc::new(CredentialStore::from_config(&config.credentials));
        let transport = ProxyTransport::bind(&config, broker, Arc::clone(&credentials)).await?;
        Ok(Self::new(config, transport, credentials))
    }
}
