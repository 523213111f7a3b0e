//! Router configuration loading.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Which transport carries agent traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageBus {
    /// Agents hold TCP connections to the router.
    #[default]
    Direct,
    /// Agents publish to a topic exchange and consume from per-identity queues.
    Broker,
}

impl MessageBus {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageBus::Direct => "direct",
            MessageBus::Broker => "broker",
        }
    }
}

impl fmt::Display for MessageBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageBus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" | "zmq" => Ok(MessageBus::Direct),
            "broker" | "rmq" => Ok(MessageBus::Broker),
            other => Err(format!("unknown message bus {other:?}")),
        }
    }
}

/// A credential agents or remote instances may authenticate with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialConfig {
    pub key_id: String,
    pub secret: String,
    /// User id assigned to connections proving this credential.
    #[serde(default)]
    pub user_id: String,
    /// Identities allowed to use this credential; empty allows any.
    #[serde(default)]
    pub identities: Vec<String>,
}

/// A remote platform instance to federate with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub instance_name: String,
    pub address: String,
    /// Credential presented to the remote router.
    #[serde(default)]
    pub credential: Option<vipbus_wire::Credential>,
    #[serde(default)]
    pub web_address: Option<String>,
}

/// Reconnect behaviour of federation links.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    /// Outbound frames buffered per link before sends are refused.
    pub link_queue_depth: usize,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            reconnect_initial_ms: 250,
            reconnect_max_ms: 30_000,
            link_queue_depth: 1024,
        }
    }
}

impl FederationConfig {
    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms.max(self.reconnect_initial_ms))
    }
}

/// Settings for a router bridging direct peers onto a broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Identity of the broker-side router told about direct peers.
    pub upstream_router: String,
    /// Queue receiving broker traffic addressed to direct peers.
    pub outbound_queue: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            upstream_router: "router".to_string(),
            outbound_queue: "proxy_outbound".to_string(),
        }
    }
}

/// Top-level router configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub instance_name: String,
    /// Identity the router answers `hello` with.
    pub identity: String,
    /// Listen addresses; the first one is the local address.
    pub bind_addresses: Vec<String>,
    pub message_bus: MessageBus,
    /// The only peer allowed to send `quit`.
    pub control_identity: String,
    /// The only peer allowed to send `peerlist add`/`drop` to the router.
    pub proxy_identity: String,
    /// User id used when authentication yields none.
    pub default_user_id: String,
    pub server_key: Option<String>,
    pub allow_anonymous: bool,
    pub central_address: Option<String>,
    pub central_serverkey: Option<String>,
    pub bind_web_address: Option<String>,
    /// Outbound messages buffered per connection before sends would block.
    pub send_queue_depth: usize,
    pub credentials: Vec<CredentialConfig>,
    pub platforms: Vec<PlatformConfig>,
    pub federation: FederationConfig,
    pub proxy: ProxyConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            instance_name: "vipbus".to_string(),
            identity: "router".to_string(),
            bind_addresses: vec!["127.0.0.1:22916".to_string()],
            message_bus: MessageBus::Direct,
            control_identity: "control".to_string(),
            proxy_identity: "proxy_router".to_string(),
            default_user_id: String::new(),
            server_key: None,
            allow_anonymous: true,
            central_address: None,
            central_serverkey: None,
            bind_web_address: None,
            send_queue_depth: 1024,
            credentials: Vec::new(),
            platforms: Vec::new(),
            federation: FederationConfig::default(),
            proxy: ProxyConfig::default(),
        }
    }
}

impl RouterConfig {
    /// The first bind address, if any.
    pub fn local_address(&self) -> Option<&str> {
        self.bind_addresses.first().map(String::as_str)
    }
}

/// Load configuration from a TOML file, falling back to defaults.
pub fn load_config(path: Option<&Path>) -> RouterConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if config_path.exists() {
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str::<RouterConfig>(&contents) {
                Ok(config) => {
                    info!(path = %config_path.display(), "Loaded configuration");
                    return config;
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        path = %config_path.display(),
                        "Failed to parse config, using defaults"
                    );
                }
            },
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to read config file, using defaults"
                );
            }
        }
    } else {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
    }

    RouterConfig::default()
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    vipbus_home().join("config.toml")
}

/// Get the default vipbus home directory.
pub fn vipbus_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".vipbus")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_config_defaults() {
        let config = load_config(Some(Path::new("/nonexistent/config.toml")));
        assert_eq!(config.identity, "router");
        assert_eq!(config.message_bus, MessageBus::Direct);
        assert_eq!(config.local_address(), Some("127.0.0.1:22916"));
    }

    #[test]
    fn test_load_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
instance_name = "building-a"
bind_addresses = ["0.0.0.0:9000"]
message_bus = "broker"
allow_anonymous = false

[[credentials]]
key_id = "hvac"
secret = "s3cret"
user_id = "hvac-user"

[[platforms]]
instance_name = "building-b"
address = "10.0.0.2:9000"
credential = {{ key_id = "fed", secret = "shared" }}

[federation]
reconnect_initial_ms = 100
"#
        )
        .unwrap();

        let config = load_config(Some(file.path()));
        assert_eq!(config.instance_name, "building-a");
        assert_eq!(config.message_bus, MessageBus::Broker);
        assert!(!config.allow_anonymous);
        assert_eq!(config.credentials[0].user_id, "hvac-user");
        assert_eq!(config.platforms[0].instance_name, "building-b");
        assert_eq!(
            config.platforms[0].credential.as_ref().map(|c| c.key_id.as_str()),
            Some("fed")
        );
        assert_eq!(config.federation.reconnect_initial_ms, 100);
        assert_eq!(config.federation.reconnect_max_ms, 30_000);
        // Unspecified fields keep their defaults.
        assert_eq!(config.control_identity, "control");
    }

    #[test]
    fn test_invalid_config_falls_back() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "message_bus = 42").unwrap();
        let config = load_config(Some(file.path()));
        assert_eq!(config.instance_name, "vipbus");
    }

    #[test]
    fn test_message_bus_parse() {
        assert_eq!("zmq".parse::<MessageBus>(), Ok(MessageBus::Direct));
        assert_eq!("Broker".parse::<MessageBus>(), Ok(MessageBus::Broker));
        assert!("carrier-pigeon".parse::<MessageBus>().is_err());
    }
}
