//! Relay client manager handle
//!
//! Tracks the relay services this node can use and hands out the local
//! relay proxy endpoint that peer connections fall back to when direct
//! candidate selection fails. Relay traffic forwarding itself happens in
//! the relay client, outside the engine.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

/// Handle to the relay client manager.
pub struct RelayManager {
    state: RwLock<RelayState>,
}

#[derive(Default)]
struct RelayState {
    /// Relay service addresses usable by this node.
    serve_addresses: Vec<String>,
    /// Local endpoint proxying to the active relay, if any.
    local_proxy: Option<SocketAddr>,
}

impl RelayManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(RelayState::default()),
        })
    }

    /// Replace the set of known relay service addresses.
    pub async fn set_serve_addresses(&self, addresses: Vec<String>) {
        debug!(count = addresses.len(), "relay addresses updated");
        self.state.write().await.serve_addresses = addresses;
    }

    /// Relay service addresses to advertise to peers.
    pub async fn serve_addresses(&self) -> Vec<String> {
        self.state.read().await.serve_addresses.clone()
    }

    /// Record the local proxy endpoint once the relay client establishes one.
    pub async fn set_local_proxy(&self, endpoint: Option<SocketAddr>) {
        self.state.write().await.local_proxy = endpoint;
    }

    /// Endpoint a driver peer entry should use for a relayed path.
    pub async fn local_proxy_endpoint(&self) -> Option<SocketAddr> {
        self.state.read().await.local_proxy
    }

    /// Whether a relayed path is currently available at all.
    pub async fn has_relay(&self) -> bool {
        let st = self.state.read().await;
        st.local_proxy.is_some() || !st.serve_addresses.is_empty()
    }
}
