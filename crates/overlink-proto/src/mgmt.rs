//! Management-plane messages
//!
//! The management service pushes declarative network maps over a long-lived
//! sync stream. A map is a full snapshot of desired state versioned by a
//! monotonically increasing serial; the engine diffs it against live state.

use serde::{Deserialize, Serialize};

use crate::dns::DnsConfig;
use crate::key::PeerKey;
use crate::route::Route;

/// One message from the management sync stream.
///
/// Carries at most one network map; other sync payloads (ephemeral events,
/// health probes) are opaque to the engine and omitted here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncResponse {
    #[serde(default)]
    pub network_map: Option<NetworkMap>,
}

/// Declarative snapshot of the desired network state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkMap {
    /// Monotonically increasing version; maps with an equal or lower serial
    /// than the last applied one are dropped.
    pub serial: u64,

    /// Desired local peer configuration, absent when unchanged.
    #[serde(default)]
    pub peer_config: Option<LocalPeerConfig>,

    /// Desired remote peer set.
    #[serde(default)]
    pub remote_peers: Vec<RemotePeerConfig>,

    /// Distinguishes "no update to peers" from "empty peer set": an empty
    /// `remote_peers` list removes all peers only when this flag is set.
    #[serde(default)]
    pub remote_peers_is_empty: bool,

    /// Peers that belong to the network but are currently offline.
    #[serde(default)]
    pub offline_peers: Vec<RemotePeerConfig>,

    /// Network routes to distribute.
    #[serde(default)]
    pub routes: Vec<Route>,

    /// DNS configuration, absent when unchanged.
    #[serde(default)]
    pub dns_config: Option<DnsConfig>,

    /// Firewall rules, forwarded opaquely to the firewall layer.
    #[serde(default)]
    pub firewall_rules: Vec<FirewallRule>,

    /// Posture checks the node must keep satisfying.
    #[serde(default)]
    pub checks: Vec<Checks>,
}

/// Configuration of the local peer as desired by management.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalPeerConfig {
    /// Overlay address in CIDR notation, e.g. `100.64.0.1/24`.
    pub address: String,

    #[serde(default)]
    pub ssh_config: Option<SshConfig>,

    /// Device fingerprint assigned by management.
    #[serde(default)]
    pub fingerprint: String,
}

/// Configuration of one remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePeerConfig {
    pub public_key: PeerKey,

    /// Prefixes routed to this peer, CIDR notation.
    #[serde(default)]
    pub allowed_ips: Vec<String>,

    #[serde(default)]
    pub ssh_config: Option<SshConfig>,

    #[serde(default)]
    pub fingerprint: Option<String>,
}

/// SSH access settings for a peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshConfig {
    #[serde(default)]
    pub ssh_enabled: bool,

    /// Public key authorized to log into the peer, OpenSSH line format.
    #[serde(default)]
    pub ssh_pub_key: Option<String>,
}

/// A firewall rule distributed by management.
///
/// The engine forwards rules without interpreting them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRule {
    pub peer_key: String,
    pub direction: i32,
    pub action: i32,
    pub protocol: i32,
    #[serde(default)]
    pub port: String,
}

/// One posture-check group: a set of files that must be present on the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checks {
    #[serde(default)]
    pub files: Vec<String>,
}

impl NetworkMap {
    /// Whether this map carries a peer-set update at all.
    ///
    /// An empty peer list with `remote_peers_is_empty == false` means
    /// "peers unchanged" and must not clear the peer set.
    pub fn has_peer_update(&self) -> bool {
        self.remote_peers_is_empty || !self.remote_peers.is_empty()
    }
}
