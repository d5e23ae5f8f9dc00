//! Engine supervisor and network-map reconciler
//!
//! The engine is the single reconciliation authority: it keeps the sync
//! stream to management alive, owns every peer connection through the
//! store, and applies network maps under a monotonic serial. One mutex
//! (`state`) linearises all mutation; collaborator calls that can enqueue
//! back into the engine never run under it.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::mpsc::Receiver;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout_at, Instant};
use tracing::{debug, error, info, trace, warn};

use overlink_net::{
    DnsServer, IfaceLookup, MgmtClient, NetResult, RelayManager, RouteManager, SignalClient,
    SshServer, TunnelDriver, UdpMux,
};
use overlink_proto::{
    Checks, FirewallRule, LocalPeerConfig, NetworkMap, PeerKey, SignalBody, SignalMessage,
    SyncResponse,
};

use crate::backoff::{Backoff, BACKOFF_INITIAL};
use crate::checks::is_checks_equal;
use crate::config::EngineConfig;
use crate::conn_mgr::{allowed_ips_equal, ConnMgr};
use crate::error::{CoreError, CoreResult};
use crate::nat::parse_nat_external_ip_mappings;
use crate::peer::{PeerConnection, PeerInput, PeerWgConfig};
use crate::peer_store::PeerStore;
use crate::status::{PeerState, Recorder};

/// Builds an SSH server on demand; invoked once per disabled→enabled
/// transition.
pub type SshServerFactory = Arc<dyn Fn() -> NetResult<Arc<dyn SshServer>> + Send + Sync>;

/// Collaborators injected into the engine.
pub struct EngineDeps {
    pub driver: Arc<dyn TunnelDriver>,
    pub signal: Arc<dyn SignalClient>,
    pub mgmt: Arc<dyn MgmtClient>,
    pub dns: Arc<dyn DnsServer>,
    pub routes: Arc<dyn RouteManager>,
    pub relay: Arc<RelayManager>,
    pub iface_lookup: Arc<dyn IfaceLookup>,
    pub ssh_factory: SshServerFactory,
}

/// Mutable engine state, guarded by the engine mutex.
struct EngineState {
    running: bool,
    network_serial: u64,
    latest_checks: Vec<Checks>,
    latest_firewall_rules: Vec<FirewallRule>,
    peer_store: PeerStore,
    conn_mgr: Option<Arc<ConnMgr>>,
    ssh_server: Option<Arc<dyn SshServer>>,
    applied_local: Option<LocalPeerConfig>,
    udp_mux: Option<UdpMux>,
}

/// The client-core engine.
pub struct Engine {
    config: Arc<EngineConfig>,
    local_key: PeerKey,
    deps: EngineDeps,
    status: Arc<Recorder>,
    state: Mutex<EngineState>,
    driver_lock: Arc<Mutex<()>>,
    shutdown: AtomicBool,
    shutdown_notify: Arc<Notify>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Create a stopped engine.
    pub fn new(config: EngineConfig, deps: EngineDeps) -> CoreResult<Arc<Self>> {
        config.validate()?;
        let local_key = config.public_key();
        Ok(Arc::new(Self {
            config: Arc::new(config),
            local_key,
            deps,
            status: Recorder::new(),
            state: Mutex::new(EngineState {
                running: false,
                network_serial: 0,
                latest_checks: Vec::new(),
                latest_firewall_rules: Vec::new(),
                peer_store: PeerStore::new(),
                conn_mgr: None,
                ssh_server: None,
                applied_local: None,
                udp_mux: None,
            }),
            driver_lock: Arc::new(Mutex::new(())),
            shutdown: AtomicBool::new(false),
            shutdown_notify: Arc::new(Notify::new()),
            tasks: StdMutex::new(Vec::new()),
        }))
    }

    /// Local public key.
    pub fn public_key(&self) -> PeerKey {
        self.local_key
    }

    /// Status recorder handle.
    pub fn status(&self) -> Arc<Recorder> {
        self.status.clone()
    }

    /// Acquire the tunnel interface, open the management and signaling
    /// streams and arm the background tasks. A failed start releases
    /// whatever it had already acquired.
    pub async fn start(self: &Arc<Self>) -> CoreResult<()> {
        let mut st = self.state.lock().await;
        if st.running {
            return Err(CoreError::AlreadyRunning);
        }
        self.shutdown.store(false, Ordering::SeqCst);
        info!(iface = %self.config.iface_name, "starting engine");

        self.deps
            .driver
            .create()
            .await
            .map_err(|e| CoreError::Startup(format!("create interface: {e}")))?;

        let mux = match self.deps.driver.up().await {
            Ok(mux) => mux,
            Err(e) => {
                let _ = self.deps.driver.close().await;
                return Err(CoreError::Startup(format!("bring interface up: {e}")));
            }
        };

        let signal_rx = match self.deps.signal.subscribe(self.local_key).await {
            Ok(rx) => rx,
            Err(e) => {
                let _ = self.deps.driver.close().await;
                return Err(CoreError::Startup(format!("signal subscription: {e}")));
            }
        };

        let sync_rx = match self.deps.mgmt.open_sync().await {
            Ok(rx) => rx,
            Err(e) => {
                let _ = self.deps.driver.close().await;
                return Err(CoreError::Startup(format!("management sync: {e}")));
            }
        };

        if let Err(e) = self.deps.routes.init().await {
            warn!(error = %e, "route manager init failed");
        }

        let local_candidates = self.gather_local_candidates(mux.local_addr());

        st.conn_mgr = Some(ConnMgr::new(
            self.config.clone(),
            self.deps.driver.clone(),
            self.deps.signal.clone(),
            self.deps.relay.clone(),
            self.status.clone(),
            self.driver_lock.clone(),
            local_candidates,
        ));
        st.udp_mux = Some(mux);
        st.running = true;
        drop(st);

        self.status.set_local(self.local_key, &self.config.overlay_addr);
        self.status.set_signal_connected(true);

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.push(tokio::spawn(self.clone().run_sync(sync_rx)));
        tasks.push(tokio::spawn(self.clone().run_signal(signal_rx)));
        tasks.push(tokio::spawn(self.clone().run_watchdog()));
        tasks.push(tokio::spawn(self.clone().run_status_flusher()));
        drop(tasks);

        info!("engine started");
        Ok(())
    }

    /// Tear down in reverse order of start. Every step is best-effort; the
    /// first error is kept and returned after all steps ran. Safe to call
    /// after a failed or partial start.
    pub async fn stop(&self) -> CoreResult<()> {
        info!("stopping engine");
        self.shutdown.store(true, Ordering::SeqCst);
        self.shutdown_notify.notify_waiters();

        let mut errors: Vec<CoreError> = Vec::new();

        {
            let mut st = self.state.lock().await;
            if st.running {
                if let Some(conn_mgr) = st.conn_mgr.clone() {
                    let ssh = st.ssh_server.clone();
                    for key in st.peer_store.keys() {
                        if let Err(e) = conn_mgr
                            .remove_peer(&mut st.peer_store, &key, ssh.as_ref())
                            .await
                        {
                            errors.push(e);
                        }
                    }
                }
                if let Some(ssh) = st.ssh_server.take() {
                    if let Err(e) = ssh.stop().await {
                        errors.push(e.into());
                    }
                }
                st.conn_mgr = None;
                st.udp_mux = None;
                st.running = false;
            }
            st.applied_local = None;
        }

        self.deps.routes.stop().await;
        self.deps.dns.stop().await;

        if let Err(e) = self.deps.driver.close().await {
            errors.push(e.into());
        }
        if let Err(e) = self.deps.mgmt.close().await {
            errors.push(e.into());
        }
        self.status.set_management_connected(false);
        self.status.set_signal_connected(false);

        // Wait for the background tasks, abandoning stragglers at the
        // deadline; their resources are reclaimed at process exit.
        let deadline = Instant::now() + self.config.stop_timeout;
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for handle in handles {
            if timeout_at(deadline, handle).await.is_err() {
                warn!("task exceeded stop deadline, abandoned");
            }
        }

        info!("engine stopped");
        match errors.into_iter().next() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Apply one network map. The only mutation entry point; the sync task
    /// and tests both come through here.
    pub async fn update_network_map(&self, nm: NetworkMap) -> CoreResult<()> {
        let mut st = self.state.lock().await;
        if !st.running {
            return Err(CoreError::NotRunning);
        }

        // Serial guard: equal or lower serials are dropped silently. The
        // guard only engages once a map has been applied.
        if st.network_serial != 0 && nm.serial <= st.network_serial {
            debug!(
                serial = nm.serial,
                current = st.network_serial,
                "skipping outdated network map"
            );
            return Ok(());
        }

        if let Some(peer_config) = nm.peer_config.clone() {
            self.apply_local_config(&mut st, &peer_config).await?;
        }

        if nm.has_peer_update() {
            self.apply_peer_update(&mut st, &nm).await?;
        } else {
            trace!("network map carries no peer update");
        }

        // Route and DNS failures are logged and do not block the commit:
        // partial success is the norm and the serial still advances.
        let classified = self.deps.routes.classify_routes(&nm.routes);
        if let Err(e) = self
            .deps
            .routes
            .update_routes(
                nm.serial,
                classified.server_routes,
                classified.client_routes,
                false,
            )
            .await
        {
            error!(error = %e, "route update failed");
        }

        let dns_config = nm.dns_config.clone().unwrap_or_default();
        if let Err(e) = self.deps.dns.update(nm.serial, dns_config).await {
            error!(error = %e, "dns update failed");
        }

        if st.latest_firewall_rules != nm.firewall_rules {
            let filter_result = {
                let _guard = self.driver_lock.lock().await;
                self.deps.driver.set_filter(nm.firewall_rules.clone()).await
            };
            if let Err(e) = filter_result {
                error!(error = %e, "firewall filter update failed");
            }
            st.latest_firewall_rules = nm.firewall_rules.clone();
        }

        if !is_checks_equal(&st.latest_checks, &nm.checks) {
            info!(groups = nm.checks.len(), "posture checks changed");
            st.latest_checks = nm.checks.clone();
        }

        self.status
            .set_offline_peers(nm.offline_peers.iter().map(|p| p.public_key).collect());

        st.network_serial = nm.serial;
        debug!(serial = nm.serial, "network map applied");
        Ok(())
    }

    async fn apply_local_config(
        &self,
        st: &mut EngineState,
        peer_config: &LocalPeerConfig,
    ) -> CoreResult<()> {
        let current_addr = st
            .applied_local
            .as_ref()
            .map(|c| c.address.clone())
            .unwrap_or_else(|| self.config.overlay_addr.clone());

        if peer_config.address != current_addr {
            info!(old = %current_addr, new = %peer_config.address, "overlay address changed");
            {
                let _guard = self.driver_lock.lock().await;
                self.deps.driver.update_addr(&peer_config.address).await?;
            }
            self.status.set_overlay_addr(&peer_config.address);
        }

        let ssh_enabled = peer_config
            .ssh_config
            .as_ref()
            .map(|c| c.ssh_enabled)
            .unwrap_or(false);
        // Peer SSH config only applies when the map's overlay address
        // matches the locally configured one.
        let want_ssh = ssh_enabled
            && self.config.ssh_allowed
            && peer_config.address == self.config.overlay_addr;
        if ssh_enabled && !want_ssh {
            warn!("ssh enable ignored, not allowed or address mismatch");
        }

        match (want_ssh, st.ssh_server.is_some()) {
            (true, false) => {
                let server = (self.deps.ssh_factory)()?;
                server.start().await?;
                for (key, conn) in st.peer_store.iter() {
                    if let Some(ssh_key) = conn.wg_config().ssh_pub_key {
                        if let Err(e) = server.add_authorized_key(*key, &ssh_key).await {
                            warn!(peer = %key.short(), error = %e, "ssh key install failed");
                        }
                    }
                }
                st.ssh_server = Some(server);
                info!("ssh server started");
            }
            (false, true) => {
                if let Some(server) = st.ssh_server.take() {
                    server.stop().await?;
                }
                info!("ssh server stopped");
            }
            _ => {}
        }

        st.applied_local = Some(peer_config.clone());
        Ok(())
    }

    async fn apply_peer_update(&self, st: &mut EngineState, nm: &NetworkMap) -> CoreResult<()> {
        let conn_mgr = st.conn_mgr.clone().ok_or(CoreError::NotRunning)?;

        let desired: HashSet<PeerKey> = nm.remote_peers.iter().map(|p| p.public_key).collect();

        for key in st.peer_store.keys() {
            if !desired.contains(&key) {
                let ssh = st.ssh_server.clone();
                conn_mgr
                    .remove_peer(&mut st.peer_store, &key, ssh.as_ref())
                    .await?;
            }
        }

        for peer in &nm.remote_peers {
            if st.peer_store.contains(&peer.public_key) {
                let conn = st.peer_store.get(&peer.public_key)?;
                let current = conn.wg_config();
                let new_ssh_key = peer
                    .ssh_config
                    .as_ref()
                    .and_then(|c| c.ssh_pub_key.clone());

                let ips_changed = !allowed_ips_equal(&current.allowed_ips, &peer.allowed_ips);
                let ssh_changed = current.ssh_pub_key != new_ssh_key;
                if !ips_changed && !ssh_changed {
                    continue;
                }

                conn_mgr.update_peer(&mut st.peer_store, peer).await?;
                if ssh_changed {
                    if let Some(server) = &st.ssh_server {
                        server.remove_authorized_key(&peer.public_key).await;
                        if let Some(key) = &new_ssh_key {
                            if let Err(e) =
                                server.add_authorized_key(peer.public_key, key).await
                            {
                                warn!(
                                    peer = %peer.public_key.short(),
                                    error = %e,
                                    "ssh key install failed"
                                );
                            }
                        }
                    }
                }
            } else {
                conn_mgr.add_peer(&mut st.peer_store, peer)?;
                if let Some(server) = &st.ssh_server {
                    if let Some(key) = peer
                        .ssh_config
                        .as_ref()
                        .and_then(|c| c.ssh_pub_key.as_ref())
                    {
                        if let Err(e) = server.add_authorized_key(peer.public_key, key).await {
                            warn!(
                                peer = %peer.public_key.short(),
                                error = %e,
                                "ssh key install failed"
                            );
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Local candidates advertised during gathering: the mux address plus
    /// any configured NAT external IPs, all on the mux port.
    fn gather_local_candidates(&self, mux_addr: SocketAddr) -> Vec<SocketAddr> {
        let mut candidates = vec![mux_addr];
        if let Some(mappings) = self.parse_nat_mappings() {
            for entry in mappings {
                let external = entry.split('/').next().unwrap_or(&entry);
                if let Ok(ip) = external.parse() {
                    candidates.push(SocketAddr::new(ip, mux_addr.port()));
                }
            }
        }
        candidates
    }

    /// Normalized NAT external-IP mappings from the engine config.
    pub fn parse_nat_mappings(&self) -> Option<Vec<String>> {
        parse_nat_external_ip_mappings(
            &self.config.nat_external_ips,
            &self.config.iface_blacklist,
            self.deps.iface_lookup.as_ref(),
        )
    }

    // =====================
    // Background tasks
    // =====================

    async fn run_sync(self: Arc<Self>, mut rx: Receiver<SyncResponse>) {
        debug!("sync task started");
        let mut backoff = Backoff::new(BACKOFF_INITIAL, self.config.sync_backoff_ceiling);
        loop {
            self.status.set_management_connected(true);
            loop {
                let msg = tokio::select! {
                    m = rx.recv() => m,
                    _ = self.shutdown_notify.notified() => return,
                };
                let Some(msg) = msg else { break };
                backoff.reset();
                if let Some(nm) = msg.network_map {
                    if let Err(e) = self.update_network_map(nm).await {
                        error!(error = %e, "failed to apply network map");
                    }
                }
            }

            self.status.set_management_connected(false);
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            let delay = backoff.next_delay();
            debug!(?delay, "sync stream ended, reconnecting");
            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.shutdown_notify.notified() => return,
            }
            match self.deps.mgmt.open_sync().await {
                Ok(new_rx) => rx = new_rx,
                Err(e) => warn!(error = %e, "management reconnect failed"),
            }
        }
    }

    async fn run_signal(self: Arc<Self>, mut rx: Receiver<SignalMessage>) {
        debug!("signal task started");
        let mut backoff = Backoff::new(BACKOFF_INITIAL, self.config.sync_backoff_ceiling);
        loop {
            self.status.set_signal_connected(true);
            loop {
                let msg = tokio::select! {
                    m = rx.recv() => m,
                    _ = self.shutdown_notify.notified() => return,
                };
                let Some(msg) = msg else { break };
                backoff.reset();
                self.handle_signal(msg).await;
            }

            self.status.set_signal_connected(false);
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            let delay = backoff.next_delay();
            debug!(?delay, "signal stream ended, resubscribing");
            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.shutdown_notify.notified() => return,
            }
            match self.deps.signal.subscribe(self.local_key).await {
                Ok(new_rx) => rx = new_rx,
                Err(e) => warn!(error = %e, "signal resubscribe failed"),
            }
        }
    }

    async fn handle_signal(&self, msg: SignalMessage) {
        if msg.to != self.local_key {
            warn!(to = %msg.to.short(), "dropping misaddressed signal message");
            return;
        }

        let conn: Option<Arc<PeerConnection>> = {
            let st = self.state.lock().await;
            if !st.running {
                return;
            }
            st.peer_store.get(&msg.from).ok()
        };

        let Some(conn) = conn else {
            debug!(peer = %msg.from.short(), "signal from unknown peer dropped");
            return;
        };

        // In lazy mode the first inbound message is the dial trigger; the
        // worker answers straight out of Idle.
        let input = match msg.body {
            SignalBody::Offer(sd) => PeerInput::RemoteOffer(sd),
            SignalBody::Answer(sd) => PeerInput::RemoteAnswer(sd),
            SignalBody::Candidate(c) => PeerInput::RemoteCandidate(c),
            SignalBody::RelayAddrs(addrs) => PeerInput::RemoteRelayAddrs(addrs),
        };
        conn.send(input);
    }

    /// Flags peers whose driver activity fell outside the keepalive window.
    async fn run_watchdog(self: Arc<Self>) {
        debug!("watchdog task started");
        let mut ticker = interval(self.config.expiration_check_interval);
        let window = self.config.keepalive * 3;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.shutdown_notify.notified() => return,
            }
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }

            let activities = self.deps.driver.last_activities().await;
            let stale: Vec<Arc<PeerConnection>> = {
                let st = self.state.lock().await;
                if !st.running {
                    continue;
                }
                let mut stale = Vec::new();
                for (key, conn) in st.peer_store.iter() {
                    let idle = activities
                        .get(key)
                        .map(|t| t.elapsed() > window)
                        .unwrap_or(false);
                    if idle && conn.state() == PeerState::Connected {
                        stale.push(conn.clone());
                    }
                }
                stale
            };

            for conn in stale {
                debug!(peer = %conn.key().short(), "peer idle past keepalive window");
                conn.send(PeerInput::Idle);
            }
        }
    }

    /// Publishes status snapshots on change, with a periodic heartbeat.
    async fn run_status_flusher(self: Arc<Self>) {
        debug!("status flusher started");
        let mut version_rx = self.status.subscribe();
        let mut ticker = interval(Duration::from_secs(30));
        loop {
            tokio::select! {
                changed = version_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = ticker.tick() => {}
                _ = self.shutdown_notify.notified() => return,
            }
            let snapshot = self.status.full_status();
            trace!(
                peers = snapshot.peers.len(),
                connected = snapshot.peers.iter().filter(|p| p.state == PeerState::Connected).count(),
                management = snapshot.management_connected,
                "status snapshot"
            );
        }
    }

    // =====================
    // Inspection
    // =====================

    /// Serial of the last applied network map.
    pub async fn network_serial(&self) -> u64 {
        self.state.lock().await.network_serial
    }

    /// Number of tracked peers.
    pub async fn peer_count(&self) -> usize {
        self.state.lock().await.peer_store.len()
    }

    /// Keys of all tracked peers.
    pub async fn peer_keys(&self) -> Vec<PeerKey> {
        self.state.lock().await.peer_store.keys()
    }

    /// Driver-facing configuration of one peer.
    pub async fn peer_wg_config(&self, key: &PeerKey) -> Option<PeerWgConfig> {
        let st = self.state.lock().await;
        st.peer_store.get(key).ok().map(|c| c.wg_config())
    }

    /// Connection object of one peer.
    pub async fn peer_conn(&self, key: &PeerKey) -> Option<Arc<PeerConnection>> {
        self.state.lock().await.peer_store.get(key).ok()
    }

    /// Whether the SSH server currently exists.
    pub async fn has_ssh_server(&self) -> bool {
        self.state.lock().await.ssh_server.is_some()
    }

    /// Firewall rules from the last applied map.
    pub async fn firewall_rules(&self) -> Vec<FirewallRule> {
        self.state.lock().await.latest_firewall_rules.clone()
    }

    /// Posture checks from the last applied map.
    pub async fn latest_checks(&self) -> Vec<Checks> {
        self.state.lock().await.latest_checks.clone()
    }
}
