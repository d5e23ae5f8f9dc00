//! Engine configuration

use std::time::Duration;

use overlink_proto::{PeerKey, SecretKey};

use crate::error::{CoreError, CoreResult};
use crate::{DEFAULT_KEEPALIVE_SECS, SYNC_BACKOFF_CEILING_SECS};

/// Immutable engine configuration.
///
/// Constructed once before `Engine::start`; everything the management plane
/// can change later arrives through network maps instead.
#[derive(Clone)]
pub struct EngineConfig {
    /// Tunnel interface name, e.g. `ovl0`.
    pub iface_name: String,

    /// Local overlay address in CIDR notation, e.g. `100.64.0.1/24`.
    pub overlay_addr: String,

    /// Local static secret key.
    pub secret_key: SecretKey,

    /// Local UDP port for the multiplexer; 0 picks an ephemeral port.
    pub udp_port: u16,

    /// Whether this node may run an SSH server at all. Network maps can
    /// only enable SSH when this is set.
    pub ssh_allowed: bool,

    /// NAT external IP mappings, `<IP>` or `<IP>/<iface-or-IP>`.
    pub nat_external_ips: Vec<String>,

    /// Interfaces never used for candidate gathering or mapping lookup.
    pub iface_blacklist: Vec<String>,

    /// Optional preshared key installed into every driver peer entry.
    pub preshared_key: Option<PeerKey>,

    /// Dial peers only once traffic or signaling demands it.
    pub lazy_connection: bool,

    /// Persistent keepalive for driver peer entries.
    pub keepalive: Duration,

    /// How long candidate gathering may run before falling back to relay.
    pub ice_gathering_timeout: Duration,

    /// Direct paths win ties unless their RTT exceeds the relay RTT by
    /// more than this.
    pub direct_rtt_penalty: Duration,

    /// Ceiling for the sync-stream reconnect backoff.
    pub sync_backoff_ceiling: Duration,

    /// How long `stop` waits for tasks before abandoning them.
    pub stop_timeout: Duration,

    /// Maximum number of peers dialing concurrently.
    pub max_concurrent_dials: usize,

    /// Interval of the connection liveness check.
    pub expiration_check_interval: Duration,
}

impl EngineConfig {
    /// Config with production defaults for the tunables.
    pub fn new(iface_name: &str, overlay_addr: &str, secret_key: SecretKey, udp_port: u16) -> Self {
        Self {
            iface_name: iface_name.to_string(),
            overlay_addr: overlay_addr.to_string(),
            secret_key,
            udp_port,
            ssh_allowed: false,
            nat_external_ips: Vec::new(),
            iface_blacklist: default_iface_blacklist(),
            preshared_key: None,
            lazy_connection: false,
            keepalive: Duration::from_secs(DEFAULT_KEEPALIVE_SECS),
            ice_gathering_timeout: Duration::from_secs(5),
            direct_rtt_penalty: Duration::from_millis(30),
            sync_backoff_ceiling: Duration::from_secs(SYNC_BACKOFF_CEILING_SECS),
            stop_timeout: Duration::from_secs(5),
            max_concurrent_dials: 10,
            expiration_check_interval: Duration::from_secs(10),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> CoreResult<()> {
        if self.iface_name.is_empty() {
            return Err(CoreError::InvalidConfig("interface name is empty".into()));
        }
        if self.overlay_addr.parse::<ipnet::IpNet>().is_err() {
            return Err(CoreError::InvalidConfig(format!(
                "overlay address {} is not a CIDR prefix",
                self.overlay_addr
            )));
        }
        if self.max_concurrent_dials == 0 {
            return Err(CoreError::InvalidConfig(
                "max_concurrent_dials must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Derived local public key.
    pub fn public_key(&self) -> PeerKey {
        self.secret_key.public_key()
    }
}

/// Interfaces that never carry usable candidates.
pub fn default_iface_blacklist() -> Vec<String> {
    ["lo", "docker0", "virbr0", "ovl"]
        .into_iter()
        .map(str::to_string)
        .collect()
}
