//! SSH server interface
//!
//! The engine creates the server when a network map enables SSH for the
//! local peer and releases it on the opposite transition. Authorized keys
//! track the remote peer set.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use overlink_proto::PeerKey;

use crate::error::{NetError, NetResult};

/// Capability interface of the SSH server.
#[async_trait]
pub trait SshServer: Send + Sync {
    /// Start accepting sessions.
    async fn start(&self) -> NetResult<()>;

    /// Stop the server and drop all sessions.
    async fn stop(&self) -> NetResult<()>;

    /// Authorize `ssh_pub_key` for logins attributed to `peer`.
    async fn add_authorized_key(&self, peer: PeerKey, ssh_pub_key: &str) -> NetResult<()>;

    /// Remove the authorization attributed to `peer`.
    async fn remove_authorized_key(&self, peer: &PeerKey);
}

/// Reference SSH server keeping only the authorized-key table.
///
/// Session handling is platform plumbing provided by the embedder; this
/// implementation backs the standalone daemon and tests.
#[derive(Default)]
pub struct KeyStoreServer {
    state: Mutex<KeyStoreState>,
}

#[derive(Default)]
struct KeyStoreState {
    running: bool,
    authorized: HashMap<PeerKey, String>,
}

impl KeyStoreServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Current authorized keys, for status surfaces and tests.
    pub async fn authorized_keys(&self) -> Vec<(PeerKey, String)> {
        let st = self.state.lock().await;
        st.authorized.iter().map(|(k, v)| (*k, v.clone())).collect()
    }
}

#[async_trait]
impl SshServer for KeyStoreServer {
    async fn start(&self) -> NetResult<()> {
        let mut st = self.state.lock().await;
        if st.running {
            return Err(NetError::AlreadyRunning);
        }
        st.running = true;
        debug!("ssh server started");
        Ok(())
    }

    async fn stop(&self) -> NetResult<()> {
        let mut st = self.state.lock().await;
        st.running = false;
        st.authorized.clear();
        debug!("ssh server stopped");
        Ok(())
    }

    async fn add_authorized_key(&self, peer: PeerKey, ssh_pub_key: &str) -> NetResult<()> {
        let mut st = self.state.lock().await;
        st.authorized.insert(peer, ssh_pub_key.to_string());
        Ok(())
    }

    async fn remove_authorized_key(&self, peer: &PeerKey) {
        let mut st = self.state.lock().await;
        st.authorized.remove(peer);
    }
}
