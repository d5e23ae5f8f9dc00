//! Client configuration

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use overlink_core::EngineConfig;
use overlink_net::StaticIfaceLookup;
use overlink_proto::SecretKey;

/// Main client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Network configuration
    pub network: NetworkConfig,
    /// Relay configuration
    #[serde(default)]
    pub relay: RelayConfig,
    /// Static interface table used to resolve NAT mapping names
    #[serde(default)]
    pub interfaces: HashMap<String, Vec<Ipv4Addr>>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Tunnel interface name
    pub iface_name: String,
    /// Overlay address in CIDR notation
    pub overlay_addr: String,
    /// Local secret key, base64
    pub secret_key: String,
    /// Local UDP port (0 = ephemeral)
    #[serde(default)]
    pub udp_port: u16,
    /// Allow running an SSH server when management enables it
    #[serde(default)]
    pub ssh_allowed: bool,
    /// NAT external IP mappings, `<IP>` or `<IP>/<iface-or-IP>`
    #[serde(default)]
    pub nat_external_ips: Vec<String>,
    /// Interfaces excluded from candidate gathering
    #[serde(default)]
    pub iface_blacklist: Vec<String>,
    /// Dial peers only when traffic or signaling demands it
    #[serde(default)]
    pub lazy_connection: bool,
}

/// Relay configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Relay service addresses this node may use
    #[serde(default)]
    pub serve_addresses: Vec<String>,
    /// Local relay proxy endpoint, when a relay client runs alongside
    #[serde(default)]
    pub local_proxy: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl ClientConfig {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    /// Convert into the engine's configuration.
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let secret_key: SecretKey = self
            .network
            .secret_key
            .parse()
            .context("parsing secret key")?;

        let mut config = EngineConfig::new(
            &self.network.iface_name,
            &self.network.overlay_addr,
            secret_key,
            self.network.udp_port,
        );
        config.ssh_allowed = self.network.ssh_allowed;
        config.nat_external_ips = self.network.nat_external_ips.clone();
        if !self.network.iface_blacklist.is_empty() {
            config.iface_blacklist = self.network.iface_blacklist.clone();
        }
        config.lazy_connection = self.network.lazy_connection;
        Ok(config)
    }

    /// Interface lookup table for NAT mapping resolution.
    pub fn iface_lookup(&self) -> StaticIfaceLookup {
        let mut lookup = StaticIfaceLookup::new();
        for (name, addrs) in &self.interfaces {
            lookup = lookup.with_iface(name, addrs.clone());
        }
        lookup
    }
}
