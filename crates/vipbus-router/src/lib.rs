//! VIP router.
//!
//! Owns the peer table, answers router-addressed subsystems, forwards
//! peer-to-peer traffic and federates with remote platform instances.
//! Peers reach the router over a direct TCP transport, an AMQP-style broker,
//! or a proxy that serves both.

pub mod auth;
pub mod config;
pub mod error;
pub mod external_rpc;
pub mod hooks;
pub mod peers;
pub mod router;
pub mod routing;
pub mod service;
pub mod subsystem;
pub mod transport;

pub use auth::CredentialStore;
pub use config::{load_config, MessageBus, PlatformConfig, RouterConfig};
pub use error::{DeliveryError, RouterError, RouterResult};
pub use hooks::{Authenticator, NullPubSub, PubSub};
pub use router::{Flow, Router};
pub use routing::{LinkEvent, PlatformInfo, PlatformState};
pub use service::{ProxyRouter, RouterHandle, RouterService};
pub use subsystem::{Handled, Subsystem};
pub use transport::broker::{Broker, BrokerConnection, BrokerTransport};
pub use transport::direct::DirectTransport;
pub use transport::proxy::ProxyTransport;
pub use transport::{FrameSink, Transport, TransportEvent};
