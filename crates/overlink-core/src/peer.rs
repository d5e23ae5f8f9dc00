//! Per-peer connection state machine
//!
//! Each remote peer gets one connection object and one worker task. The
//! worker exchanges session credentials and path candidates over
//! signaling, prefers a direct path, falls back to the relay proxy when
//! gathering times out, and installs the chosen endpoint into the tunnel
//! driver together with the full allowed-IP set. Signaling delivery is
//! at-least-once, so every input is safe to receive twice.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use ipnet::IpNet;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace, warn};

use overlink_net::{PeerUpdate, RelayManager, SignalClient, TunnelDriver};
use overlink_proto::{
    IceCandidate, PeerKey, SessionDescription, SignalBody, SignalMessage,
};

use crate::backoff::{Backoff, BACKOFF_INITIAL};
use crate::config::EngineConfig;
use crate::status::{PeerState, Recorder};

/// Inputs consumed by a peer worker.
#[derive(Debug)]
pub enum PeerInput {
    /// Start dialing.
    Open,
    /// Remote peer wants a session with us.
    RemoteOffer(SessionDescription),
    /// Remote peer accepted our session.
    RemoteAnswer(SessionDescription),
    /// One path candidate towards the remote peer.
    RemoteCandidate(IceCandidate),
    /// Relay services the remote peer is reachable through.
    RemoteRelayAddrs(Vec<String>),
    /// The driver saw no activity within the keepalive window.
    Idle,
    /// Stop the worker.
    Shutdown,
}

/// Driver-facing configuration of one peer.
#[derive(Debug, Clone)]
pub struct PeerWgConfig {
    pub allowed_ips: Vec<IpNet>,
    pub keepalive: Duration,
    pub endpoint: Option<SocketAddr>,
    pub preshared_key: Option<PeerKey>,
    pub ssh_pub_key: Option<String>,
}

/// Everything a peer worker needs from the engine.
#[derive(Clone)]
pub struct PeerDeps {
    pub local_key: PeerKey,
    pub config: Arc<EngineConfig>,
    pub driver: Arc<dyn TunnelDriver>,
    pub signal: Arc<dyn SignalClient>,
    pub relay: Arc<RelayManager>,
    pub status: Arc<Recorder>,
    /// Serialises all driver mutations across workers and the reconciler.
    pub driver_lock: Arc<Mutex<()>>,
    /// Caps the number of concurrently dialing peers.
    pub dial_permits: Arc<Semaphore>,
    /// Local candidates advertised to the remote side: the UDP mux address
    /// plus any configured NAT external IPs.
    pub local_candidates: Vec<SocketAddr>,
}

/// Handle to one peer connection.
///
/// Owned by the peer store; the worker task holds the other half of the
/// input channel and exits when it receives `Shutdown` or the handle goes
/// away.
pub struct PeerConnection {
    key: PeerKey,
    wg_config: Arc<StdMutex<PeerWgConfig>>,
    state_rx: watch::Receiver<PeerState>,
    input_tx: UnboundedSender<PeerInput>,
    has_driver_entry: AtomicBool,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("key", &self.key)
            .field("has_driver_entry", &self.has_driver_entry())
            .finish()
    }
}

impl PeerConnection {
    /// Create the connection object and spawn its worker.
    pub fn spawn(key: PeerKey, initial: PeerWgConfig, deps: PeerDeps) -> Arc<Self> {
        let wg_config = Arc::new(StdMutex::new(initial));
        let (state_tx, state_rx) = watch::channel(PeerState::Idle);
        let (input_tx, input_rx) = mpsc::unbounded_channel();

        let conn = Arc::new(Self {
            key,
            wg_config: wg_config.clone(),
            state_rx,
            input_tx,
            has_driver_entry: AtomicBool::new(false),
            task: StdMutex::new(None),
        });

        let worker = PeerWorker {
            key,
            deps,
            wg_config,
            state: PeerState::Idle,
            state_tx,
            rx: input_rx,
            conn: Arc::downgrade(&conn),
            session: None,
            backoff: Backoff::new(BACKOFF_INITIAL, Duration::from_secs(60)),
            redial_at: None,
            last_remote_seq: 0,
            local_seq: 0,
        };
        let handle = tokio::spawn(worker.run());
        *conn.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        conn
    }

    pub fn key(&self) -> PeerKey {
        self.key
    }

    /// Current state machine state.
    pub fn state(&self) -> PeerState {
        *self.state_rx.borrow()
    }

    /// Snapshot of the driver-facing configuration.
    pub fn wg_config(&self) -> PeerWgConfig {
        self.wg_config
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Mutate the driver-facing configuration in place.
    pub(crate) fn set_wg_config(&self, f: impl FnOnce(&mut PeerWgConfig)) {
        let mut cfg = self.wg_config.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut cfg);
    }

    /// Whether a driver entry was installed and not explicitly removed.
    pub fn has_driver_entry(&self) -> bool {
        self.has_driver_entry.load(Ordering::Acquire)
    }

    pub fn mark_driver_entry(&self, present: bool) {
        self.has_driver_entry.store(present, Ordering::Release);
    }

    /// Feed one input to the worker. Inputs to a finished worker are
    /// dropped silently.
    pub fn send(&self, input: PeerInput) {
        if self.input_tx.send(input).is_err() {
            trace!(peer = %self.key.short(), "input dropped, worker gone");
        }
    }

    /// Begin dialing.
    pub fn open(&self) {
        self.send(PeerInput::Open);
    }

    /// Ask the worker to stop. The driver entry is left untouched; the
    /// caller removes it explicitly when the peer is being dropped.
    pub fn close(&self) {
        self.send(PeerInput::Shutdown);
    }

    #[cfg(test)]
    pub(crate) fn stub(key: PeerKey) -> Arc<Self> {
        let (_state_tx, state_rx) = watch::channel(PeerState::Idle);
        let (input_tx, _input_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            key,
            wg_config: Arc::new(StdMutex::new(PeerWgConfig {
                allowed_ips: Vec::new(),
                keepalive: Duration::from_secs(25),
                endpoint: None,
                preshared_key: None,
                ssh_pub_key: None,
            })),
            state_rx,
            input_tx,
            has_driver_entry: AtomicBool::new(false),
            task: StdMutex::new(None),
        })
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            // Last handle gone without an explicit close; don't leave the
            // worker running detached forever.
            handle.abort();
        }
    }
}

/// One candidate path with its provenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PathChoice {
    pub endpoint: SocketAddr,
    pub relayed: bool,
    pub rtt: Option<Duration>,
}

/// Pick between a direct and a relayed path.
///
/// Direct wins unless its RTT exceeds the relay RTT by more than
/// `penalty`; unknown RTTs keep the direct preference.
pub(crate) fn select_path(
    direct: Option<PathChoice>,
    relay: Option<PathChoice>,
    penalty: Duration,
) -> Option<PathChoice> {
    match (direct, relay) {
        (Some(d), Some(r)) => match (d.rtt, r.rtt) {
            (Some(drtt), Some(rrtt)) if drtt > rrtt + penalty => Some(r),
            _ => Some(d),
        },
        (Some(d), None) => Some(d),
        (None, relay) => relay,
    }
}

struct DialSession {
    local: SessionDescription,
    remote: Option<SessionDescription>,
    remote_candidates: Vec<IceCandidate>,
    remote_relay: Vec<String>,
    gather_deadline: Option<Instant>,
    _permit: Option<OwnedSemaphorePermit>,
}

struct PeerWorker {
    key: PeerKey,
    deps: PeerDeps,
    wg_config: Arc<StdMutex<PeerWgConfig>>,
    state: PeerState,
    state_tx: watch::Sender<PeerState>,
    rx: UnboundedReceiver<PeerInput>,
    conn: std::sync::Weak<PeerConnection>,
    session: Option<DialSession>,
    backoff: Backoff,
    redial_at: Option<Instant>,
    last_remote_seq: u64,
    local_seq: u64,
}

impl PeerWorker {
    async fn run(mut self) {
        debug!(peer = %self.key.short(), "peer worker started");
        loop {
            let timer = self.next_deadline();
            let input = tokio::select! {
                input = self.rx.recv() => input,
                _ = async { sleep_until(timer.unwrap_or_else(Instant::now)).await },
                    if timer.is_some() =>
                {
                    self.on_timer().await;
                    continue;
                }
            };

            let Some(input) = input else { break };
            match input {
                PeerInput::Shutdown => {
                    self.set_state(PeerState::Disconnected, None, false);
                    break;
                }
                PeerInput::Open => self.start_dial().await,
                PeerInput::RemoteOffer(sd) => self.on_remote_offer(sd).await,
                PeerInput::RemoteAnswer(sd) => self.on_remote_answer(sd).await,
                PeerInput::RemoteCandidate(c) => self.on_remote_candidate(c).await,
                PeerInput::RemoteRelayAddrs(addrs) => self.on_relay_addrs(addrs).await,
                PeerInput::Idle => self.on_driver_idle().await,
            }
        }
        debug!(peer = %self.key.short(), "peer worker stopped");
    }

    fn next_deadline(&self) -> Option<Instant> {
        let gather = self.session.as_ref().and_then(|s| s.gather_deadline);
        match (gather, self.redial_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, b) => b,
        }
    }

    fn set_state(&mut self, state: PeerState, endpoint: Option<SocketAddr>, relayed: bool) {
        if self.state != state {
            debug!(
                peer = %self.key.short(),
                "peer state {:?} -> {:?}", self.state, state
            );
        }
        self.state = state;
        let _ = self.state_tx.send(state);
        self.deps
            .status
            .update_peer_state(&self.key, state, endpoint, relayed);
    }

    async fn start_dial(&mut self) {
        match self.state {
            PeerState::Dialing | PeerState::Connecting | PeerState::Connected => return,
            _ => {}
        }

        let permit = match self.deps.dial_permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                // All dial slots busy; retry shortly.
                self.redial_at = Some(Instant::now() + Duration::from_millis(500));
                return;
            }
        };
        self.redial_at = None;

        self.local_seq += 1;
        let local = SessionDescription {
            ufrag: random_token(8),
            pwd: random_token(24),
            relay_capable: self.deps.relay.has_relay().await,
            session_seq: self.local_seq,
        };
        self.session = Some(DialSession {
            local: local.clone(),
            remote: None,
            remote_candidates: Vec::new(),
            remote_relay: Vec::new(),
            // Also bounds the wait for the remote answer; an unanswered
            // offer redials instead of idling in Dialing forever.
            gather_deadline: Some(Instant::now() + self.deps.config.ice_gathering_timeout),
            _permit: Some(permit),
        });

        self.set_state(PeerState::Dialing, None, false);
        self.send_signal(SignalBody::Offer(local)).await;
        self.announce_relay().await;
    }

    async fn on_remote_offer(&mut self, sd: SessionDescription) {
        if sd.session_seq != 0 && sd.session_seq <= self.last_remote_seq {
            // Duplicate delivery; repeat the answer so the remote can make
            // progress, but keep the current session.
            if let Some(session) = &self.session {
                let local = session.local.clone();
                self.send_signal(SignalBody::Answer(local)).await;
            }
            return;
        }

        if self.state == PeerState::Dialing && self.deps.local_key < self.key {
            // Offer glare: the lower key stays initiator, so ours stands
            // and the remote is expected to answer it.
            trace!(peer = %self.key.short(), "ignoring remote offer, local dial wins glare");
            return;
        }

        self.last_remote_seq = sd.session_seq;

        let permit = match self.session.take() {
            Some(existing) => existing._permit,
            None => self.deps.dial_permits.clone().try_acquire_owned().ok(),
        };

        self.local_seq += 1;
        let local = SessionDescription {
            ufrag: random_token(8),
            pwd: random_token(24),
            relay_capable: self.deps.relay.has_relay().await,
            session_seq: self.local_seq,
        };
        self.session = Some(DialSession {
            local: local.clone(),
            remote: Some(sd),
            remote_candidates: Vec::new(),
            remote_relay: Vec::new(),
            gather_deadline: Some(Instant::now() + self.deps.config.ice_gathering_timeout),
            _permit: permit,
        });

        self.send_signal(SignalBody::Answer(local)).await;
        self.set_state(PeerState::Connecting, None, false);
        self.send_local_candidates().await;
        self.announce_relay().await;
    }

    async fn on_remote_answer(&mut self, sd: SessionDescription) {
        let Some(session) = self.session.as_mut() else {
            trace!(peer = %self.key.short(), "answer without session, dropping");
            return;
        };
        if session.remote.is_some() {
            // Duplicate answer; candidate exchange is already under way.
            return;
        }
        session.remote = Some(sd);
        session.gather_deadline =
            Some(Instant::now() + self.deps.config.ice_gathering_timeout);
        self.set_state(PeerState::Connecting, None, false);
        self.send_local_candidates().await;
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        let Some(session) = self.session.as_mut() else {
            trace!(peer = %self.key.short(), "candidate without session, dropping");
            return;
        };
        if session.remote_candidates.contains(&candidate) {
            return;
        }
        session.remote_candidates.push(candidate);
        self.try_select(false).await;
    }

    async fn on_relay_addrs(&mut self, addrs: Vec<String>) {
        if let Some(session) = self.session.as_mut() {
            session.remote_relay = addrs;
        }
    }

    async fn on_driver_idle(&mut self) {
        if self.state != PeerState::Connected {
            return;
        }
        info!(peer = %self.key.short(), "no driver activity within keepalive window");
        // The driver entry stays installed so traffic can resume as soon as
        // a new path is selected.
        self.session = None;
        self.set_state(PeerState::Disconnected, None, false);
        self.redial_at = Some(Instant::now() + self.backoff.next_delay());
    }

    async fn on_timer(&mut self) {
        let now = Instant::now();

        if let Some(deadline) = self.session.as_ref().and_then(|s| s.gather_deadline) {
            if now >= deadline {
                match self.state {
                    PeerState::Connecting => {
                        self.try_select(true).await;
                        return;
                    }
                    PeerState::Dialing => {
                        debug!(peer = %self.key.short(), "dial timed out waiting for answer");
                        self.session = None;
                        self.set_state(PeerState::Disconnected, None, false);
                        self.redial_at = Some(Instant::now() + self.backoff.next_delay());
                        return;
                    }
                    _ => {}
                }
            }
        }

        if let Some(redial) = self.redial_at {
            if now >= redial {
                self.redial_at = None;
                match self.state {
                    PeerState::Idle | PeerState::Disconnected => self.start_dial().await,
                    _ => {}
                }
            }
        }
    }

    /// Attempt to choose a path. Before the gathering deadline only a
    /// direct path is installed; once `deadline_expired` the relay is
    /// acceptable too.
    async fn try_select(&mut self, deadline_expired: bool) {
        if self.state != PeerState::Connecting {
            return;
        }
        let Some(session) = self.session.as_ref() else { return };

        let direct = best_direct(&session.remote_candidates);
        let relay = self.relay_path(session).await;

        let choice = if deadline_expired {
            select_path(direct, relay, self.deps.config.direct_rtt_penalty)
        } else {
            select_path(direct, None, self.deps.config.direct_rtt_penalty)
        };

        let Some(path) = choice else {
            if deadline_expired {
                warn!(peer = %self.key.short(), "no usable path, will redial");
                self.session = None;
                self.set_state(PeerState::Disconnected, None, false);
                self.redial_at = Some(Instant::now() + self.backoff.next_delay());
            }
            return;
        };

        if path.relayed {
            self.set_state(PeerState::RelayFallback, None, true);
        }
        self.install(path).await;
    }

    async fn relay_path(&self, session: &DialSession) -> Option<PathChoice> {
        let remote_can_relay = session
            .remote
            .as_ref()
            .map(|r| r.relay_capable)
            .unwrap_or(false)
            || !session.remote_relay.is_empty();
        if !remote_can_relay {
            return None;
        }
        let endpoint = self.deps.relay.local_proxy_endpoint().await?;
        Some(PathChoice {
            endpoint,
            relayed: true,
            rtt: None,
        })
    }

    /// Install the selected endpoint into the driver. The update carries
    /// the full allowed-IP set, so a reconnect replaces the entry in one
    /// step and the peer is never left half-configured.
    async fn install(&mut self, path: PathChoice) {
        let update = {
            let cfg = self.wg_config.lock().unwrap_or_else(|e| e.into_inner());
            PeerUpdate {
                key: self.key,
                allowed_ips: cfg.allowed_ips.clone(),
                keepalive: cfg.keepalive,
                endpoint: Some(path.endpoint),
                preshared_key: cfg.preshared_key,
            }
        };

        let result = {
            let _guard = self.deps.driver_lock.lock().await;
            self.deps.driver.update_peer(&update).await
        };

        match result {
            Ok(()) => {
                {
                    let mut cfg = self.wg_config.lock().unwrap_or_else(|e| e.into_inner());
                    cfg.endpoint = Some(path.endpoint);
                }
                if let Some(conn) = self.conn.upgrade() {
                    conn.mark_driver_entry(true);
                }
                if let Some(session) = self.session.as_mut() {
                    session.gather_deadline = None;
                    session._permit = None;
                }
                self.backoff.reset();
                info!(
                    peer = %self.key.short(),
                    endpoint = %path.endpoint,
                    relayed = path.relayed,
                    "peer connected"
                );
                self.set_state(PeerState::Connected, Some(path.endpoint), path.relayed);
            }
            Err(e) => {
                warn!(peer = %self.key.short(), error = %e, "driver rejected peer update");
                self.session = None;
                self.set_state(PeerState::Disconnected, None, false);
                self.redial_at = Some(Instant::now() + self.backoff.next_delay());
            }
        }
    }

    async fn send_local_candidates(&mut self) {
        for addr in self.deps.local_candidates.clone() {
            let candidate = IceCandidate {
                candidate: format!("host {addr}"),
                addr: Some(addr),
                rtt_ms: None,
            };
            self.send_signal(SignalBody::Candidate(candidate)).await;
        }
    }

    async fn announce_relay(&mut self) {
        let addrs = self.deps.relay.serve_addresses().await;
        if !addrs.is_empty() {
            self.send_signal(SignalBody::RelayAddrs(addrs)).await;
        }
    }

    async fn send_signal(&self, body: SignalBody) {
        let msg = SignalMessage {
            from: self.deps.local_key,
            to: self.key,
            body,
        };
        if let Err(e) = self.deps.signal.send(msg).await {
            // Transient; the remote side retries and redials recover.
            debug!(peer = %self.key.short(), error = %e, "signal send failed");
        }
    }
}

/// Best direct candidate: lowest known RTT, otherwise the first one that
/// carries a resolved address.
fn best_direct(candidates: &[IceCandidate]) -> Option<PathChoice> {
    let mut best: Option<PathChoice> = None;
    for c in candidates {
        let Some(addr) = c.addr else { continue };
        let choice = PathChoice {
            endpoint: addr,
            relayed: false,
            rtt: c.rtt_ms.map(|ms| Duration::from_millis(ms as u64)),
        };
        best = match best {
            None => Some(choice),
            Some(current) => match (current.rtt, choice.rtt) {
                (None, Some(_)) => Some(choice),
                (Some(a), Some(b)) if b < a => Some(choice),
                _ => Some(current),
            },
        };
    }
    best
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
