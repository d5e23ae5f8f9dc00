//! Status recorder
//!
//! Collects per-peer state transitions and engine-level connectivity into a
//! snapshot the daemon surfaces to operators. The recorder carries its own
//! lock so peer tasks can report without touching the engine mutex; a
//! version counter lets the flusher task publish only on change.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::watch;

use overlink_proto::PeerKey;

/// Connection state of one peer as seen by its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Tracked but not dialing yet
    Idle,
    /// Offer sent, waiting for the remote session
    Dialing,
    /// Session agreed, selecting a path
    Connecting,
    /// Direct selection failed, using a relayed path
    RelayFallback,
    /// A usable path is installed in the driver
    Connected,
    /// Lost the path, will redial
    Disconnected,
}

/// Status of one tracked peer.
#[derive(Debug, Clone)]
pub struct PeerStatus {
    pub key: PeerKey,
    pub state: PeerState,
    pub endpoint: Option<SocketAddr>,
    pub relayed: bool,
    pub fingerprint: Option<String>,
    pub last_change: Instant,
}

/// Full engine status snapshot.
#[derive(Debug, Clone)]
pub struct FullStatus {
    pub local_key: Option<PeerKey>,
    pub overlay_addr: Option<String>,
    pub management_connected: bool,
    pub signal_connected: bool,
    pub peers: Vec<PeerStatus>,
    /// Peers in the network map that are currently offline.
    pub offline_peers: Vec<PeerKey>,
}

/// Thread-safe status recorder.
pub struct Recorder {
    inner: Mutex<Inner>,
    version_tx: watch::Sender<u64>,
}

#[derive(Default)]
struct Inner {
    local_key: Option<PeerKey>,
    overlay_addr: Option<String>,
    management_connected: bool,
    signal_connected: bool,
    peers: HashMap<PeerKey, PeerStatus>,
    offline_peers: Vec<PeerKey>,
    version: u64,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        let (version_tx, _) = watch::channel(0);
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            version_tx,
        })
    }

    fn mutate(&self, f: impl FnOnce(&mut Inner)) {
        let version = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut inner);
            inner.version += 1;
            inner.version
        };
        let _ = self.version_tx.send(version);
    }

    /// Record the local identity once the engine starts.
    pub fn set_local(&self, key: PeerKey, overlay_addr: &str) {
        let addr = overlay_addr.to_string();
        self.mutate(|inner| {
            inner.local_key = Some(key);
            inner.overlay_addr = Some(addr);
        });
    }

    /// Record a change of the local overlay address.
    pub fn set_overlay_addr(&self, overlay_addr: &str) {
        let addr = overlay_addr.to_string();
        self.mutate(|inner| inner.overlay_addr = Some(addr));
    }

    pub fn set_management_connected(&self, connected: bool) {
        self.mutate(|inner| inner.management_connected = connected);
    }

    pub fn set_signal_connected(&self, connected: bool) {
        self.mutate(|inner| inner.signal_connected = connected);
    }

    /// Record the offline peer set from the latest network map.
    pub fn set_offline_peers(&self, keys: Vec<PeerKey>) {
        self.mutate(|inner| inner.offline_peers = keys);
    }

    /// Track a new peer in `Idle`.
    pub fn add_peer(&self, key: PeerKey, fingerprint: Option<String>) {
        self.mutate(|inner| {
            inner.peers.entry(key).or_insert(PeerStatus {
                key,
                state: PeerState::Idle,
                endpoint: None,
                relayed: false,
                fingerprint,
                last_change: Instant::now(),
            });
        });
    }

    /// Drop a peer from the snapshot.
    pub fn remove_peer(&self, key: &PeerKey) {
        let key = *key;
        self.mutate(|inner| {
            inner.peers.remove(&key);
        });
    }

    /// Record a state transition for a peer.
    pub fn update_peer_state(
        &self,
        key: &PeerKey,
        state: PeerState,
        endpoint: Option<SocketAddr>,
        relayed: bool,
    ) {
        let key = *key;
        self.mutate(|inner| {
            if let Some(peer) = inner.peers.get_mut(&key) {
                peer.state = state;
                peer.endpoint = endpoint;
                peer.relayed = relayed;
                peer.last_change = Instant::now();
            }
        });
    }

    /// Current snapshot.
    pub fn full_status(&self) -> FullStatus {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        FullStatus {
            local_key: inner.local_key,
            overlay_addr: inner.overlay_addr.clone(),
            management_connected: inner.management_connected,
            signal_connected: inner.signal_connected,
            peers: inner.peers.values().cloned().collect(),
            offline_peers: inner.offline_peers.clone(),
        }
    }

    /// Number of peers currently in `Connected`.
    pub fn connected_peers(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .peers
            .values()
            .filter(|p| p.state == PeerState::Connected)
            .count()
    }

    /// Subscribe to snapshot-version bumps; used by the flusher task.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version_tx.subscribe()
    }
}
