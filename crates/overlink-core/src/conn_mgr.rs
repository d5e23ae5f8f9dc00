//! Connection manager
//!
//! Policy layer above the peer store: admission (eager vs lazy dialing),
//! dial throttling and teardown ordering. It is the only component that
//! creates or removes peer-store entries in response to network-map
//! deltas; the reconciler decides *what* changes, the manager decides
//! *how*.

use std::net::SocketAddr;
use std::sync::Arc;

use ipnet::IpNet;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

use overlink_net::{PeerUpdate, RelayManager, SignalClient, SshServer, TunnelDriver};
use overlink_proto::{PeerKey, RemotePeerConfig};

use crate::config::EngineConfig;
use crate::error::{CoreError, CoreResult};
use crate::peer::{PeerConnection, PeerDeps, PeerWgConfig};
use crate::peer_store::PeerStore;
use crate::status::Recorder;

/// Creates, mutates and tears down peer connections.
///
/// Methods take the peer store by reference: the caller holds the engine
/// mutex, which linearises every mutation.
pub struct ConnMgr {
    config: Arc<EngineConfig>,
    local_key: PeerKey,
    driver: Arc<dyn TunnelDriver>,
    signal: Arc<dyn SignalClient>,
    relay: Arc<RelayManager>,
    status: Arc<Recorder>,
    driver_lock: Arc<Mutex<()>>,
    dial_permits: Arc<Semaphore>,
    local_candidates: Vec<SocketAddr>,
}

impl ConnMgr {
    pub fn new(
        config: Arc<EngineConfig>,
        driver: Arc<dyn TunnelDriver>,
        signal: Arc<dyn SignalClient>,
        relay: Arc<RelayManager>,
        status: Arc<Recorder>,
        driver_lock: Arc<Mutex<()>>,
        local_candidates: Vec<SocketAddr>,
    ) -> Arc<Self> {
        let local_key = config.public_key();
        let dial_permits = Arc::new(Semaphore::new(config.max_concurrent_dials));
        Arc::new(Self {
            config,
            local_key,
            driver,
            signal,
            relay,
            status,
            driver_lock,
            dial_permits,
            local_candidates,
        })
    }

    /// Admit a new peer: create its connection object, register it and, in
    /// eager mode, start dialing immediately. Lazy mode leaves the peer in
    /// `Idle` until signaling or traffic wakes it.
    pub fn add_peer(
        &self,
        store: &mut PeerStore,
        peer: &RemotePeerConfig,
    ) -> CoreResult<Arc<PeerConnection>> {
        let wg_config = self.wg_config_for(peer)?;
        let deps = PeerDeps {
            local_key: self.local_key,
            config: self.config.clone(),
            driver: self.driver.clone(),
            signal: self.signal.clone(),
            relay: self.relay.clone(),
            status: self.status.clone(),
            driver_lock: self.driver_lock.clone(),
            dial_permits: self.dial_permits.clone(),
            local_candidates: self.local_candidates.clone(),
        };

        let conn = PeerConnection::spawn(peer.public_key, wg_config, deps);
        store.add(peer.public_key, conn.clone())?;
        self.status
            .add_peer(peer.public_key, peer.fingerprint.clone());

        if self.config.lazy_connection {
            debug!(peer = %peer.public_key.short(), "peer admitted lazily");
        } else {
            conn.open();
        }
        info!(peer = %peer.public_key.short(), "peer added");
        Ok(conn)
    }

    /// Tear a peer down in order: stop the worker, remove the driver
    /// entry, drop the SSH authorization, drop the status entry.
    pub async fn remove_peer(
        &self,
        store: &mut PeerStore,
        key: &PeerKey,
        ssh: Option<&Arc<dyn SshServer>>,
    ) -> CoreResult<()> {
        let conn = store.remove(key)?;
        conn.close();

        let removal = {
            let _guard = self.driver_lock.lock().await;
            self.driver.remove_peer(key).await
        };
        conn.mark_driver_entry(false);
        if let Err(e) = removal {
            // The entry may already be gone; the peer is dropped regardless.
            warn!(peer = %key.short(), error = %e, "driver peer removal failed");
        }

        if let Some(ssh) = ssh {
            ssh.remove_authorized_key(key).await;
        }
        self.status.remove_peer(key);
        info!(peer = %key.short(), "peer removed");
        Ok(())
    }

    /// Apply a config change to an existing peer without tearing the
    /// connection down. Allowed-IP changes reach the driver immediately
    /// when an entry is installed, even while the state machine is idle.
    pub async fn update_peer(
        &self,
        store: &mut PeerStore,
        peer: &RemotePeerConfig,
    ) -> CoreResult<()> {
        let conn = store.get(&peer.public_key)?;
        let allowed_ips = parse_allowed_ips(&peer.allowed_ips)?;
        let ssh_pub_key = peer
            .ssh_config
            .as_ref()
            .and_then(|c| c.ssh_pub_key.clone());

        conn.set_wg_config(|cfg| {
            cfg.allowed_ips = allowed_ips;
            cfg.ssh_pub_key = ssh_pub_key;
        });

        if conn.has_driver_entry() {
            let cfg = conn.wg_config();
            let update = PeerUpdate {
                key: peer.public_key,
                allowed_ips: cfg.allowed_ips,
                keepalive: cfg.keepalive,
                endpoint: cfg.endpoint,
                preshared_key: cfg.preshared_key,
            };
            let result = {
                let _guard = self.driver_lock.lock().await;
                self.driver.update_peer(&update).await
            };
            if let Err(e) = result {
                // Peer-specific failure: flag it for redial, leave the rest
                // of the reconcile untouched.
                warn!(peer = %peer.public_key.short(), error = %e, "driver update failed");
                conn.send(crate::peer::PeerInput::Idle);
            }
        }
        debug!(peer = %peer.public_key.short(), "peer config updated");
        Ok(())
    }

    fn wg_config_for(&self, peer: &RemotePeerConfig) -> CoreResult<PeerWgConfig> {
        Ok(PeerWgConfig {
            allowed_ips: parse_allowed_ips(&peer.allowed_ips)?,
            keepalive: self.config.keepalive,
            endpoint: None,
            preshared_key: self.config.preshared_key,
            ssh_pub_key: peer
                .ssh_config
                .as_ref()
                .and_then(|c| c.ssh_pub_key.clone()),
        })
    }
}

/// Parse the allowed-IP list from a peer config.
pub(crate) fn parse_allowed_ips(raw: &[String]) -> CoreResult<Vec<IpNet>> {
    raw.iter()
        .map(|s| {
            s.parse::<IpNet>()
                .map_err(|e| CoreError::InvalidConfig(format!("allowed ip {s}: {e}")))
        })
        .collect()
}

/// Order-insensitive comparison of a parsed allowed-IP list against its
/// raw string form; duplicates count.
pub(crate) fn allowed_ips_equal(parsed: &[IpNet], raw: &[String]) -> bool {
    let Ok(mut other) = parse_allowed_ips(raw) else {
        return false;
    };
    if parsed.len() != other.len() {
        return false;
    }
    let mut mine = parsed.to_vec();
    mine.sort();
    other.sort();
    mine == other
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_allowed_ips() {
        let parsed = parse_allowed_ips(&["100.64.0.10/24".to_string()]).unwrap();
        assert_eq!(parsed.len(), 1);

        assert!(parse_allowed_ips(&["not-a-prefix".to_string()]).is_err());
    }

    #[test]
    fn test_allowed_ips_equal_ignores_order() {
        let parsed = parse_allowed_ips(&[
            "10.0.0.0/8".to_string(),
            "192.168.1.0/24".to_string(),
        ])
        .unwrap();

        assert!(allowed_ips_equal(
            &parsed,
            &["192.168.1.0/24".to_string(), "10.0.0.0/8".to_string()]
        ));
        assert!(!allowed_ips_equal(&parsed, &["192.168.1.0/24".to_string()]));
        assert!(!allowed_ips_equal(&parsed, &["invalid".to_string()]));
    }

    #[test]
    fn test_allowed_ips_equal_counts_duplicates() {
        let parsed = parse_allowed_ips(&[
            "192.168.1.0/24".to_string(),
            "192.168.1.0/24".to_string(),
        ])
        .unwrap();
        assert!(!allowed_ips_equal(&parsed, &["192.168.1.0/24".to_string()]));
    }
}
