//! Tunnel driver abstraction
//!
//! The engine owns a tunnel interface but never touches the kernel itself:
//! every mutation goes through this trait. Kernel and platform drivers live
//! in their own crates; the `UserspaceDriver` here keeps the whole peer
//! table in memory and backs tests and the standalone daemon.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ipnet::IpNet;
use tokio::sync::RwLock;
use tracing::debug;

use overlink_proto::{FirewallRule, PeerKey};

use crate::error::{NetError, NetResult};
use crate::mux::UdpMux;

/// Address assigned to the local tunnel interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IfaceAddress {
    pub ip: IpAddr,
    pub network: IpNet,
}

impl IfaceAddress {
    /// Parse from CIDR notation, e.g. `100.64.0.1/24`.
    pub fn parse(cidr: &str) -> NetResult<Self> {
        let network: IpNet = cidr
            .parse()
            .map_err(|e| NetError::Driver(format!("invalid address {cidr}: {e}")))?;
        Ok(Self {
            ip: network.addr(),
            network,
        })
    }
}

impl std::fmt::Display for IfaceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.ip, self.network.prefix_len())
    }
}

/// Full desired state for one driver peer entry.
///
/// The driver replaces the entry atomically, so allowed IPs and endpoint
/// always change together and a reconnect never leaves a window with a
/// partially configured peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerUpdate {
    pub key: PeerKey,
    pub allowed_ips: Vec<IpNet>,
    pub keepalive: Duration,
    pub endpoint: Option<SocketAddr>,
    pub preshared_key: Option<PeerKey>,
}

/// Transfer counters for one peer entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerStats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Capability interface of the tunnel driver.
#[async_trait]
pub trait TunnelDriver: Send + Sync {
    /// Create the interface.
    async fn create(&self) -> NetResult<()>;

    /// Bring the interface up and hand out the shared UDP multiplexer.
    async fn up(&self) -> NetResult<UdpMux>;

    /// Interface name.
    fn name(&self) -> String;

    /// Currently assigned overlay address.
    fn address(&self) -> IfaceAddress;

    /// Replace the interface address.
    async fn update_addr(&self, addr: &str) -> NetResult<()>;

    /// Install or replace the entry for one peer.
    async fn update_peer(&self, update: &PeerUpdate) -> NetResult<()>;

    /// Remove the entry for one peer.
    async fn remove_peer(&self, key: &PeerKey) -> NetResult<()>;

    /// Add a single allowed prefix to an existing peer entry.
    async fn add_allowed_ip(&self, key: &PeerKey, prefix: IpNet) -> NetResult<()>;

    /// Remove a single allowed prefix from an existing peer entry.
    async fn remove_allowed_ip(&self, key: &PeerKey, prefix: IpNet) -> NetResult<()>;

    /// Install the packet filter rules.
    async fn set_filter(&self, rules: Vec<FirewallRule>) -> NetResult<()>;

    /// Currently installed filter rules.
    async fn filter(&self) -> Vec<FirewallRule>;

    /// Tear the interface down.
    async fn close(&self) -> NetResult<()>;

    /// Monotonic last-handshake/traffic timestamps per peer.
    async fn last_activities(&self) -> HashMap<PeerKey, Instant>;

    /// Transfer counters per peer.
    async fn stats(&self) -> NetResult<HashMap<PeerKey, PeerStats>>;
}

/// In-memory tunnel driver.
///
/// Keeps the peer table and activity clocks without any kernel interface;
/// `up()` binds a real UDP socket so candidate gathering has a local port
/// to work with.
pub struct UserspaceDriver {
    name: String,
    port: u16,
    // Address is read synchronously from hot paths, so it lives outside the
    // async state lock.
    address: std::sync::RwLock<IfaceAddress>,
    state: RwLock<DriverState>,
}

struct DriverState {
    peers: HashMap<PeerKey, PeerUpdate>,
    activity: HashMap<PeerKey, Instant>,
    filter: Vec<FirewallRule>,
    up: bool,
}

impl UserspaceDriver {
    pub fn new(name: &str, address: IfaceAddress, port: u16) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            port,
            address: std::sync::RwLock::new(address),
            state: RwLock::new(DriverState {
                peers: HashMap::new(),
                activity: HashMap::new(),
                filter: Vec::new(),
                up: false,
            }),
        })
    }

    /// Snapshot of the peer table, used by status surfaces and tests.
    pub async fn peers(&self) -> Vec<PeerUpdate> {
        self.state.read().await.peers.values().cloned().collect()
    }

    /// Record traffic for a peer, refreshing its activity clock.
    pub async fn touch_peer(&self, key: &PeerKey) {
        let mut st = self.state.write().await;
        if st.peers.contains_key(key) {
            st.activity.insert(*key, Instant::now());
        }
    }
}

#[async_trait]
impl TunnelDriver for UserspaceDriver {
    async fn create(&self) -> NetResult<()> {
        debug!(name = %self.name, "creating userspace interface");
        Ok(())
    }

    async fn up(&self) -> NetResult<UdpMux> {
        let mut st = self.state.write().await;
        if st.up {
            return Err(NetError::AlreadyRunning);
        }
        let mux = UdpMux::bind(self.port).await?;
        st.up = true;
        debug!(name = %self.name, addr = %mux.local_addr(), "interface up");
        Ok(mux)
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn address(&self) -> IfaceAddress {
        *self.address.read().unwrap_or_else(|e| e.into_inner())
    }

    async fn update_addr(&self, addr: &str) -> NetResult<()> {
        let parsed = IfaceAddress::parse(addr)?;
        *self.address.write().unwrap_or_else(|e| e.into_inner()) = parsed;
        Ok(())
    }

    async fn update_peer(&self, update: &PeerUpdate) -> NetResult<()> {
        let mut st = self.state.write().await;
        st.activity.insert(update.key, Instant::now());
        st.peers.insert(update.key, update.clone());
        Ok(())
    }

    async fn remove_peer(&self, key: &PeerKey) -> NetResult<()> {
        let mut st = self.state.write().await;
        st.peers.remove(key);
        st.activity.remove(key);
        Ok(())
    }

    async fn add_allowed_ip(&self, key: &PeerKey, prefix: IpNet) -> NetResult<()> {
        let mut st = self.state.write().await;
        let peer = st
            .peers
            .get_mut(key)
            .ok_or_else(|| NetError::PeerRejected(key.short(), "unknown peer".to_string()))?;
        if !peer.allowed_ips.contains(&prefix) {
            peer.allowed_ips.push(prefix);
        }
        Ok(())
    }

    async fn remove_allowed_ip(&self, key: &PeerKey, prefix: IpNet) -> NetResult<()> {
        let mut st = self.state.write().await;
        let peer = st
            .peers
            .get_mut(key)
            .ok_or_else(|| NetError::PeerRejected(key.short(), "unknown peer".to_string()))?;
        peer.allowed_ips.retain(|p| *p != prefix);
        Ok(())
    }

    async fn set_filter(&self, rules: Vec<FirewallRule>) -> NetResult<()> {
        self.state.write().await.filter = rules;
        Ok(())
    }

    async fn filter(&self) -> Vec<FirewallRule> {
        self.state.read().await.filter.clone()
    }

    async fn close(&self) -> NetResult<()> {
        let mut st = self.state.write().await;
        st.peers.clear();
        st.activity.clear();
        st.filter.clear();
        st.up = false;
        debug!(name = %self.name, "interface closed");
        Ok(())
    }

    async fn last_activities(&self) -> HashMap<PeerKey, Instant> {
        self.state.read().await.activity.clone()
    }

    async fn stats(&self) -> NetResult<HashMap<PeerKey, PeerStats>> {
        let st = self.state.read().await;
        Ok(st.peers.keys().map(|k| (*k, PeerStats::default())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use overlink_proto::KeyPair;

    fn test_update(key: PeerKey) -> PeerUpdate {
        PeerUpdate {
            key,
            allowed_ips: vec!["100.64.0.10/32".parse().unwrap()],
            keepalive: Duration::from_secs(25),
            endpoint: None,
            preshared_key: None,
        }
    }

    #[tokio::test]
    async fn test_peer_table_lifecycle() {
        let addr = IfaceAddress::parse("100.64.0.1/24").unwrap();
        let driver = UserspaceDriver::new("ovl0", addr, 0);
        let key = KeyPair::generate().public;

        driver.update_peer(&test_update(key)).await.unwrap();
        assert_eq!(driver.peers().await.len(), 1);
        assert!(driver.last_activities().await.contains_key(&key));

        driver
            .add_allowed_ip(&key, "100.64.0.11/32".parse().unwrap())
            .await
            .unwrap();
        let peers = driver.peers().await;
        assert_eq!(peers[0].allowed_ips.len(), 2);

        driver.remove_peer(&key).await.unwrap();
        assert!(driver.peers().await.is_empty());
        assert!(driver.last_activities().await.is_empty());
    }

    #[tokio::test]
    async fn test_allowed_ip_on_unknown_peer_is_rejected() {
        let addr = IfaceAddress::parse("100.64.0.1/24").unwrap();
        let driver = UserspaceDriver::new("ovl0", addr, 0);
        let key = KeyPair::generate().public;

        let err = driver
            .add_allowed_ip(&key, "100.64.0.11/32".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::PeerRejected(_, _)));
    }
}
