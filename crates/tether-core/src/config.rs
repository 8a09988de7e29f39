//! Configuration system for tether.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $TETHER_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/tether/config.toml
//!   3. ~/.config/tether/config.toml

use std::collections::BTreeMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::identity::DEFAULT_POW_DIFFICULTY;
use crate::wire::PublicKey;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub remote: RemoteConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Identity file (private key and proof of work). Generated on first run.
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the UDP socket binds to.
    pub bind: String,
    /// UDP port. 0 = OS-assigned.
    pub port: u16,
}

/// Everything the remote message stack needs at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Overlay network id. Traffic with another id is dropped.
    pub network_id: i32,

    /// Super peers as `public_key_hex@host:port`. Empty = this node is a
    /// top-level super peer and mediates unites.
    pub super_peers: Vec<String>,

    /// Fixed routes, public key hex → `host:port`.
    pub static_routes: BTreeMap<String, String>,

    pub ping_interval_ms: u64,
    /// A peer without control traffic for this long is stale.
    pub ping_timeout_ms: u64,
    /// A rendezvous peer without application traffic for this long is dropped.
    pub ping_communication_timeout_ms: u64,
    /// Upper bound of outstanding pings.
    pub ping_max_peers: usize,

    /// Cool-down between two unites for the same pair. 0 disables uniting.
    pub unite_min_interval_ms: u64,

    /// Largest datagram handed to the transport.
    pub message_mtu: usize,
    /// Largest composed message accepted or sent.
    pub message_max_content_length: usize,
    /// Partial chunked messages are discarded after this long.
    pub message_composed_transfer_timeout_ms: u64,
    /// Messages are not forwarded once this many hops are reached.
    pub message_hop_limit: u8,
    /// Arm outbound messages and require arming on inbound ones.
    pub message_arm_enabled: bool,

    /// Required leading zero nibbles of every sender's proof of work.
    pub pow_difficulty: u8,

    /// Control messages of one type from one sender are accepted at most
    /// once per window.
    pub rate_limit_window_ms: u64,

    /// Announce and listen on the local multicast group.
    pub local_discovery: bool,
}

/// A configured peer endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub public_key: PublicKey,
    pub address: SocketAddr,
}

impl Endpoint {
    /// Parse `public_key_hex@host:port`. Host names are resolved here.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let (key, address) = text
            .split_once('@')
            .ok_or_else(|| ConfigError::InvalidEndpoint(text.to_string()))?;
        Ok(Self {
            public_key: key
                .parse()
                .map_err(|_| ConfigError::InvalidEndpoint(text.to_string()))?,
            address: resolve(address).ok_or_else(|| ConfigError::InvalidEndpoint(text.to_string()))?,
        })
    }
}

fn resolve(address: &str) -> Option<SocketAddr> {
    address.to_socket_addrs().ok()?.next()
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            path: config_dir().join("identity.toml"),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 22527,
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            network_id: 1,
            super_peers: Vec::new(),
            static_routes: BTreeMap::new(),
            ping_interval_ms: 5_000,
            ping_timeout_ms: 30_000,
            ping_communication_timeout_ms: 60_000,
            ping_max_peers: 100,
            unite_min_interval_ms: 20_000,
            message_mtu: 1432,
            message_max_content_length: 1_048_576, // 1 MiB
            message_composed_transfer_timeout_ms: 60_000,
            message_hop_limit: 8,
            message_arm_enabled: true,
            pow_difficulty: DEFAULT_POW_DIFFICULTY,
            rate_limit_window_ms: 100,
            local_discovery: true,
        }
    }
}

impl RemoteConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn super_peer_endpoints(&self) -> Result<Vec<Endpoint>, ConfigError> {
        self.super_peers.iter().map(|s| Endpoint::parse(s)).collect()
    }

    pub fn static_route_endpoints(&self) -> Result<Vec<Endpoint>, ConfigError> {
        self.static_routes
            .iter()
            .map(|(key, address)| Endpoint::parse(&format!("{key}@{address}")))
            .collect()
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("tether")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid endpoint {0:?}, expected public_key@host:port")]
    InvalidEndpoint(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl TetherConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            TetherConfig::default()
        };
        config.apply_env_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("TETHER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&TetherConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply TETHER_* overrides. `lookup` reads one variable.
    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("TETHER_NETWORK__BIND") {
            self.network.bind = v;
        }
        if let Some(v) = lookup("TETHER_NETWORK__PORT") {
            if let Ok(p) = v.parse() {
                self.network.port = p;
            }
        }
        if let Some(v) = lookup("TETHER_REMOTE__NETWORK_ID") {
            if let Ok(id) = v.parse() {
                self.remote.network_id = id;
            }
        }
        if let Some(v) = lookup("TETHER_REMOTE__SUPER_PEERS") {
            self.remote.super_peers = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = lookup("TETHER_REMOTE__LOCAL_DISCOVERY") {
            self.remote.local_discovery = v == "true" || v == "1";
        }
    }
}
