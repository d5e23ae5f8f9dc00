//! Engine integration tests
//!
//! Exercise the reconciler and the peer lifecycle against mock
//! collaborators implementing the capability traits, plus a small
//! in-process mesh over the local signaling hub.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;

use overlink_core::{CoreError, Engine, EngineConfig, EngineDeps};
use overlink_net::{
    classify_by_public_key, DnsServer, IfaceAddress, KeyStoreServer, LocalHub, MgmtClient,
    NetError, NetResult, PeerStats, PeerUpdate, RelayManager, RouteManager, SignalClient,
    SshServer, StaticIfaceLookup, TunnelDriver, UdpMux,
};
use overlink_proto::{
    ClassifiedRoutes, CustomZone, DnsConfig, HaMap, KeyPair, LocalPeerConfig, NameServer,
    NameServerGroup, NetworkMap, PeerKey, RemotePeerConfig, Route, RouteId, SecretKey,
    SessionDescription, SignalBody, SignalMessage, SimpleRecord, SshConfig, SyncResponse,
};

// =====================
// Mock collaborators
// =====================

#[derive(Debug, Clone, PartialEq, Eq)]
enum DriverCall {
    UpdatePeer(PeerKey, Vec<ipnet::IpNet>, Option<SocketAddr>),
    RemovePeer(PeerKey),
    UpdateAddr(String),
}

#[derive(Default)]
struct MockDriver {
    calls: std::sync::Mutex<Vec<DriverCall>>,
    activity: std::sync::Mutex<HashMap<PeerKey, Instant>>,
    reject_updates: AtomicBool,
}

impl MockDriver {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn calls(&self) -> Vec<DriverCall> {
        self.calls.lock().unwrap().clone()
    }

    fn remove_count(&self, key: &PeerKey) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, DriverCall::RemovePeer(k) if k == key))
            .count()
    }

    fn last_update_for(&self, key: &PeerKey) -> Option<(Vec<ipnet::IpNet>, Option<SocketAddr>)> {
        self.calls().iter().rev().find_map(|c| match c {
            DriverCall::UpdatePeer(k, ips, ep) if k == key => Some((ips.clone(), *ep)),
            _ => None,
        })
    }

    fn addr_updates(&self) -> Vec<String> {
        self.calls()
            .iter()
            .filter_map(|c| match c {
                DriverCall::UpdateAddr(a) => Some(a.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl TunnelDriver for MockDriver {
    async fn create(&self) -> NetResult<()> {
        Ok(())
    }

    async fn up(&self) -> NetResult<UdpMux> {
        UdpMux::bind(0).await
    }

    fn name(&self) -> String {
        "utun-mock".to_string()
    }

    fn address(&self) -> IfaceAddress {
        IfaceAddress::parse("100.64.0.1/24").unwrap()
    }

    async fn update_addr(&self, addr: &str) -> NetResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push(DriverCall::UpdateAddr(addr.to_string()));
        Ok(())
    }

    async fn update_peer(&self, update: &PeerUpdate) -> NetResult<()> {
        if self.reject_updates.load(Ordering::SeqCst) {
            return Err(NetError::PeerRejected(
                update.key.short(),
                "mocked rejection".to_string(),
            ));
        }
        self.calls.lock().unwrap().push(DriverCall::UpdatePeer(
            update.key,
            update.allowed_ips.clone(),
            update.endpoint,
        ));
        self.activity.lock().unwrap().insert(update.key, Instant::now());
        Ok(())
    }

    async fn remove_peer(&self, key: &PeerKey) -> NetResult<()> {
        self.calls.lock().unwrap().push(DriverCall::RemovePeer(*key));
        self.activity.lock().unwrap().remove(key);
        Ok(())
    }

    async fn add_allowed_ip(&self, _key: &PeerKey, _prefix: ipnet::IpNet) -> NetResult<()> {
        Ok(())
    }

    async fn remove_allowed_ip(&self, _key: &PeerKey, _prefix: ipnet::IpNet) -> NetResult<()> {
        Ok(())
    }

    async fn set_filter(&self, _rules: Vec<overlink_proto::FirewallRule>) -> NetResult<()> {
        Ok(())
    }

    async fn filter(&self) -> Vec<overlink_proto::FirewallRule> {
        Vec::new()
    }

    async fn close(&self) -> NetResult<()> {
        Ok(())
    }

    async fn last_activities(&self) -> HashMap<PeerKey, Instant> {
        self.activity.lock().unwrap().clone()
    }

    async fn stats(&self) -> NetResult<HashMap<PeerKey, PeerStats>> {
        Ok(HashMap::new())
    }
}

struct MockMgmt {
    sender: Mutex<Option<mpsc::Sender<SyncResponse>>>,
}

impl MockMgmt {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sender: Mutex::new(None),
        })
    }

    async fn push(&self, msg: SyncResponse) {
        let sender = self.sender.lock().await.clone();
        sender
            .expect("sync stream not open")
            .send(msg)
            .await
            .unwrap();
    }
}

#[async_trait]
impl MgmtClient for MockMgmt {
    async fn open_sync(&self) -> NetResult<mpsc::Receiver<SyncResponse>> {
        let (tx, rx) = mpsc::channel(16);
        *self.sender.lock().await = Some(tx);
        Ok(rx)
    }

    async fn close(&self) -> NetResult<()> {
        self.sender.lock().await.take();
        Ok(())
    }
}

#[derive(Default)]
struct MockDns {
    calls: std::sync::Mutex<Vec<(u64, DnsConfig)>>,
    fail: AtomicBool,
}

impl MockDns {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn calls(&self) -> Vec<(u64, DnsConfig)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl DnsServer for MockDns {
    async fn update(&self, serial: u64, config: DnsConfig) -> NetResult<()> {
        self.calls.lock().unwrap().push((serial, config));
        if self.fail.load(Ordering::SeqCst) {
            return Err(NetError::Dns("mocked error".to_string()));
        }
        Ok(())
    }

    async fn stop(&self) {}
}

struct MockRoutes {
    local_key: String,
    calls: std::sync::Mutex<Vec<(u64, usize, HaMap)>>,
    fail: AtomicBool,
}

impl MockRoutes {
    fn new(local_key: String) -> Arc<Self> {
        Arc::new(Self {
            local_key,
            calls: std::sync::Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        })
    }

    fn calls(&self) -> Vec<(u64, usize, HaMap)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RouteManager for MockRoutes {
    async fn init(&self) -> NetResult<()> {
        Ok(())
    }

    async fn update_routes(
        &self,
        serial: u64,
        server_routes: HashMap<RouteId, Route>,
        client_routes: HaMap,
        _use_new_dns_route: bool,
    ) -> NetResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push((serial, server_routes.len(), client_routes));
        if self.fail.load(Ordering::SeqCst) {
            return Err(NetError::Route("mocked error".to_string()));
        }
        Ok(())
    }

    fn classify_routes(&self, new_routes: &[Route]) -> ClassifiedRoutes {
        classify_by_public_key(new_routes, &self.local_key)
    }

    async fn stop(&self) {}
}

// =====================
// Test harness
// =====================

struct TestEnv {
    engine: Arc<Engine>,
    driver: Arc<MockDriver>,
    mgmt: Arc<MockMgmt>,
    dns: Arc<MockDns>,
    routes: Arc<MockRoutes>,
    ssh: Arc<KeyStoreServer>,
}

async fn start_engine(mut config: EngineConfig) -> TestEnv {
    config.expiration_check_interval = Duration::from_millis(50);
    let driver = MockDriver::new();
    let mgmt = MockMgmt::new();
    let dns = MockDns::new();
    let routes = MockRoutes::new(config.public_key().to_string());
    let ssh = KeyStoreServer::new();

    let ssh_for_factory = ssh.clone();
    let deps = EngineDeps {
        driver: driver.clone(),
        signal: LocalHub::new(),
        mgmt: mgmt.clone(),
        dns: dns.clone(),
        routes: routes.clone(),
        relay: RelayManager::new(),
        iface_lookup: Arc::new(StaticIfaceLookup::new()),
        ssh_factory: Arc::new(move || Ok(ssh_for_factory.clone() as Arc<dyn SshServer>)),
    };

    let engine = Engine::new(config, deps).unwrap();
    engine.start().await.unwrap();

    TestEnv {
        engine,
        driver,
        mgmt,
        dns,
        routes,
        ssh,
    }
}

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::new("utun100", "100.64.0.1/24", SecretKey::generate(), 0);
    config.ice_gathering_timeout = Duration::from_millis(300);
    config
}

fn make_deps(config: &EngineConfig) -> EngineDeps {
    EngineDeps {
        driver: MockDriver::new(),
        signal: LocalHub::new(),
        mgmt: MockMgmt::new(),
        dns: MockDns::new(),
        routes: MockRoutes::new(config.public_key().to_string()),
        relay: RelayManager::new(),
        iface_lookup: Arc::new(StaticIfaceLookup::new()),
        ssh_factory: Arc::new(|| Ok(KeyStoreServer::new() as Arc<dyn SshServer>)),
    }
}

fn remote_peer(key: PeerKey, allowed: &[&str]) -> RemotePeerConfig {
    RemotePeerConfig {
        public_key: key,
        allowed_ips: allowed.iter().map(|s| s.to_string()).collect(),
        ssh_config: None,
        fingerprint: None,
    }
}

fn peers_map(serial: u64, peers: Vec<RemotePeerConfig>) -> NetworkMap {
    NetworkMap {
        serial,
        remote_peers: peers,
        remote_peers_is_empty: false,
        ..Default::default()
    }
}

async fn wait_until<F, Fut>(deadline: Duration, probe: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let end = Instant::now() + deadline;
    loop {
        if probe().await {
            return;
        }
        if Instant::now() > end {
            panic!("timeout while waiting for condition");
        }
        sleep(Duration::from_millis(20)).await;
    }
}

// =====================
// Reconciler tests
// =====================

#[tokio::test]
async fn test_update_network_map_peer_deltas() {
    let env = start_engine(test_config()).await;
    let peer1 = KeyPair::generate().public;
    let peer2 = KeyPair::generate().public;
    let peer3 = KeyPair::generate().public;

    struct Case {
        name: &'static str,
        map: NetworkMap,
        expected_len: usize,
        expected_serial: u64,
        expected_peers: Vec<(PeerKey, Vec<&'static str>)>,
    }

    let cases = vec![
        Case {
            name: "a new peer to add",
            map: peers_map(1, vec![remote_peer(peer1, &["100.64.0.10/24"])]),
            expected_len: 1,
            expected_serial: 1,
            expected_peers: vec![(peer1, vec!["100.64.0.10/24"])],
        },
        Case {
            name: "an old peer and a new peer to add",
            map: peers_map(
                2,
                vec![
                    remote_peer(peer1, &["100.64.0.10/24"]),
                    remote_peer(peer2, &["100.64.0.11/24"]),
                ],
            ),
            expected_len: 2,
            expected_serial: 2,
            expected_peers: vec![
                (peer1, vec!["100.64.0.10/24"]),
                (peer2, vec!["100.64.0.11/24"]),
            ],
        },
        Case {
            name: "outdated update to ignore",
            map: peers_map(
                0,
                vec![
                    remote_peer(peer1, &["100.64.0.10/24"]),
                    remote_peer(peer2, &["100.64.0.11/24"]),
                    remote_peer(peer3, &["100.64.0.12/24"]),
                ],
            ),
            expected_len: 2,
            expected_serial: 2,
            expected_peers: vec![
                (peer1, vec!["100.64.0.10/24"]),
                (peer2, vec!["100.64.0.11/24"]),
            ],
        },
        Case {
            name: "one peer to remove and one to add",
            map: peers_map(
                4,
                vec![
                    remote_peer(peer2, &["100.64.0.11/24"]),
                    remote_peer(peer3, &["100.64.0.12/24"]),
                ],
            ),
            expected_len: 2,
            expected_serial: 4,
            expected_peers: vec![
                (peer2, vec!["100.64.0.11/24"]),
                (peer3, vec!["100.64.0.12/24"]),
            ],
        },
        Case {
            name: "one peer to modify",
            map: peers_map(
                5,
                vec![
                    remote_peer(peer3, &["100.64.0.20/24"]),
                    remote_peer(peer2, &["100.64.0.11/24"]),
                ],
            ),
            expected_len: 2,
            expected_serial: 5,
            expected_peers: vec![
                (peer2, vec!["100.64.0.11/24"]),
                (peer3, vec!["100.64.0.20/24"]),
            ],
        },
        Case {
            name: "all peers to remove",
            map: NetworkMap {
                serial: 6,
                remote_peers: Vec::new(),
                remote_peers_is_empty: true,
                ..Default::default()
            },
            expected_len: 0,
            expected_serial: 6,
            expected_peers: Vec::new(),
        },
    ];

    for case in cases {
        env.engine.update_network_map(case.map).await.unwrap();

        assert_eq!(
            env.engine.peer_count().await,
            case.expected_len,
            "peer count mismatch in case: {}",
            case.name
        );
        assert_eq!(
            env.engine.network_serial().await,
            case.expected_serial,
            "serial mismatch in case: {}",
            case.name
        );

        for (key, allowed) in case.expected_peers {
            let cfg = env
                .engine
                .peer_wg_config(&key)
                .await
                .unwrap_or_else(|| panic!("peer missing in case: {}", case.name));
            let expected: Vec<ipnet::IpNet> = allowed.iter().map(|s| s.parse().unwrap()).collect();
            assert_eq!(
                cfg.allowed_ips, expected,
                "allowed ips mismatch in case: {}",
                case.name
            );
        }
    }

    env.engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_serial_ordering() {
    let env = start_engine(test_config()).await;
    let peer = KeyPair::generate().public;

    let mut applied = Vec::new();
    for serial in [1u64, 2, 0, 4, 4, 5] {
        env.engine
            .update_network_map(peers_map(
                serial,
                vec![remote_peer(peer, &["100.64.0.10/24"])],
            ))
            .await
            .unwrap();
        applied.push(env.engine.network_serial().await);
    }

    assert_eq!(applied, vec![1, 2, 2, 4, 4, 5]);
    // Only serials 1, 2, 4 and 5 got through to the subsystems.
    assert_eq!(env.dns.calls().len(), 4);

    env.engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_peer_remove_calls_driver_once() {
    let env = start_engine(test_config()).await;
    let a = KeyPair::generate().public;
    let b = KeyPair::generate().public;
    let c = KeyPair::generate().public;

    env.engine
        .update_network_map(peers_map(1, vec![remote_peer(a, &["100.64.0.10/24"])]))
        .await
        .unwrap();
    assert_eq!(env.engine.peer_keys().await, vec![a]);

    env.engine
        .update_network_map(peers_map(
            2,
            vec![
                remote_peer(a, &["100.64.0.10/24"]),
                remote_peer(b, &["100.64.0.11/24"]),
            ],
        ))
        .await
        .unwrap();
    assert_eq!(env.engine.peer_count().await, 2);

    env.engine
        .update_network_map(peers_map(
            3,
            vec![
                remote_peer(b, &["100.64.0.11/24"]),
                remote_peer(c, &["100.64.0.12/24"]),
            ],
        ))
        .await
        .unwrap();

    let mut keys = env.engine.peer_keys().await;
    keys.sort();
    let mut expected = vec![b, c];
    expected.sort();
    assert_eq!(keys, expected);
    assert_eq!(env.driver.remove_count(&a), 1);

    env.engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_peer_modify_keeps_connection() {
    let env = start_engine(test_config()).await;
    let c = KeyPair::generate().public;

    env.engine
        .update_network_map(peers_map(1, vec![remote_peer(c, &["100.64.0.12/24"])]))
        .await
        .unwrap();
    let conn_before = env.engine.peer_conn(&c).await.unwrap();

    // Pretend the worker already installed a driver entry so the
    // modification reaches the driver immediately.
    conn_before.mark_driver_entry(true);

    env.engine
        .update_network_map(peers_map(2, vec![remote_peer(c, &["100.64.0.20/24"])]))
        .await
        .unwrap();

    let conn_after = env.engine.peer_conn(&c).await.unwrap();
    assert!(Arc::ptr_eq(&conn_before, &conn_after));

    let expected: Vec<ipnet::IpNet> = vec!["100.64.0.20/24".parse().unwrap()];
    assert_eq!(
        env.engine.peer_wg_config(&c).await.unwrap().allowed_ips,
        expected
    );
    let (ips, _) = env.driver.last_update_for(&c).unwrap();
    assert_eq!(ips, expected);

    env.engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_remote_peers_empty_flag() {
    let env = start_engine(test_config()).await;
    let peer = KeyPair::generate().public;

    env.engine
        .update_network_map(peers_map(1, vec![remote_peer(peer, &["100.64.0.10/24"])]))
        .await
        .unwrap();
    assert_eq!(env.engine.peer_count().await, 1);

    // Empty list without the flag means "peers unchanged".
    env.engine
        .update_network_map(peers_map(2, Vec::new()))
        .await
        .unwrap();
    assert_eq!(env.engine.peer_count().await, 1);
    assert_eq!(env.engine.network_serial().await, 2);

    // With the flag the peer set is cleared.
    env.engine
        .update_network_map(NetworkMap {
            serial: 3,
            remote_peers: Vec::new(),
            remote_peers_is_empty: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(env.engine.peer_count().await, 0);

    env.engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_overlay_address_change_reaches_driver() {
    let env = start_engine(test_config()).await;

    env.engine
        .update_network_map(NetworkMap {
            serial: 1,
            peer_config: Some(LocalPeerConfig {
                address: "100.70.0.1/24".to_string(),
                ssh_config: None,
                fingerprint: String::new(),
            }),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(env.driver.addr_updates(), vec!["100.70.0.1/24".to_string()]);

    // Same address again: no second driver call.
    env.engine
        .update_network_map(NetworkMap {
            serial: 2,
            peer_config: Some(LocalPeerConfig {
                address: "100.70.0.1/24".to_string(),
                ssh_config: None,
                fingerprint: String::new(),
            }),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(env.driver.addr_updates().len(), 1);

    env.engine.stop().await.unwrap();
}

// =====================
// SSH lifecycle
// =====================

#[tokio::test]
async fn test_ssh_lifecycle() {
    let ssh_key =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIFATYCqaQw/9id1Qkq3n16JYhDhXraI6Pc1fgB8ynEfQ";
    let peer = KeyPair::generate().public;
    let peer_with_ssh = RemotePeerConfig {
        public_key: peer,
        allowed_ips: vec!["100.64.0.21/24".to_string()],
        ssh_config: Some(SshConfig {
            ssh_enabled: false,
            ssh_pub_key: Some(ssh_key.to_string()),
        }),
        fingerprint: None,
    };

    let local_ssh_config = |enabled: bool| {
        Some(LocalPeerConfig {
            address: "100.64.0.1/24".to_string(),
            ssh_config: Some(SshConfig {
                ssh_enabled: enabled,
                ssh_pub_key: None,
            }),
            fingerprint: String::new(),
        })
    };

    let mut config = test_config();
    config.ssh_allowed = true;
    let env = start_engine(config).await;

    // SSH disabled: the remote peer's key must be ignored.
    env.engine
        .update_network_map(peers_map(6, vec![peer_with_ssh.clone()]))
        .await
        .unwrap();
    assert!(!env.engine.has_ssh_server().await);
    assert!(env.ssh.authorized_keys().await.is_empty());

    // SSH enabled: server created once, existing peer key installed.
    env.engine
        .update_network_map(NetworkMap {
            serial: 7,
            peer_config: local_ssh_config(true),
            remote_peers: vec![peer_with_ssh.clone()],
            remote_peers_is_empty: false,
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(env.engine.has_ssh_server().await);
    let keys = env.ssh.authorized_keys().await;
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].1, ssh_key);

    // Peer removed: its authorization goes away with it.
    env.engine
        .update_network_map(NetworkMap {
            serial: 8,
            peer_config: local_ssh_config(true),
            remote_peers: Vec::new(),
            remote_peers_is_empty: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(env.engine.has_ssh_server().await);
    assert!(env.ssh.authorized_keys().await.is_empty());

    // SSH disabled again: the server is released before the call returns.
    env.engine
        .update_network_map(NetworkMap {
            serial: 9,
            peer_config: local_ssh_config(false),
            remote_peers: vec![peer_with_ssh],
            remote_peers_is_empty: false,
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(!env.engine.has_ssh_server().await);

    env.engine.stop().await.unwrap();
}

// =====================
// Routes and DNS
// =====================

fn test_route(id: &str, network: &str, net_id: &str, peer: &str) -> Route {
    Route {
        id: id.to_string(),
        network: network.parse().unwrap(),
        net_id: net_id.to_string(),
        peer: peer.to_string(),
        network_type: 1,
        masquerade: false,
        metric: 9999,
    }
}

#[tokio::test]
async fn test_routes_passed_to_manager() {
    let env = start_engine(test_config()).await;

    env.engine
        .update_network_map(NetworkMap {
            serial: 1,
            routes: vec![
                test_route("a", "192.168.0.0/24", "n1", "p1"),
                test_route("b", "192.168.1.0/24", "n2", "p1"),
            ],
            ..Default::default()
        })
        .await
        .unwrap();

    let calls = env.routes.calls();
    assert_eq!(calls.len(), 1);
    let (serial, server_len, client_routes) = &calls[0];
    assert_eq!(*serial, 1);
    assert_eq!(*server_len, 0);
    assert_eq!(client_routes.len(), 2);
    assert_eq!(client_routes["n1|192.168.0.0/24"][0].id, "a");
    assert_eq!(client_routes["n2|192.168.1.0/24"][0].id, "b");

    env.engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_route_error_does_not_break_engine() {
    let env = start_engine(test_config()).await;
    env.routes.fail.store(true, Ordering::SeqCst);

    env.engine
        .update_network_map(NetworkMap {
            serial: 1,
            routes: vec![test_route("a", "192.168.0.0/24", "n1", "p1")],
            ..Default::default()
        })
        .await
        .unwrap();

    // The serial still advances: route failures are non-fatal.
    assert_eq!(env.engine.network_serial().await, 1);

    env.engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_dns_config_passed_to_server() {
    let env = start_engine(test_config()).await;

    let dns_config = DnsConfig {
        service_enable: true,
        custom_zones: vec![
            CustomZone {
                domain: "overlink.cloud.".to_string(),
                records: vec![SimpleRecord {
                    name: "peer-a.overlink.cloud.".to_string(),
                    record_type: 1,
                    class: "IN".to_string(),
                    ttl: 300,
                    rdata: "100.64.0.1".to_string(),
                }],
            },
            CustomZone {
                domain: "0.66.100.in-addr.arpa.".to_string(),
                records: Vec::new(),
            },
        ],
        name_server_groups: vec![NameServerGroup {
            primary: true,
            domains: Vec::new(),
            name_servers: vec![NameServer {
                ip: "8.8.8.8".parse().unwrap(),
                ns_type: 1,
                port: 53,
            }],
            search_domains_enabled: false,
        }],
    };

    env.engine
        .update_network_map(NetworkMap {
            serial: 1,
            dns_config: Some(dns_config.clone()),
            ..Default::default()
        })
        .await
        .unwrap();

    let calls = env.dns.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, 1);
    assert_eq!(calls[0].1, dns_config);

    env.engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_dns_error_does_not_break_engine() {
    let env = start_engine(test_config()).await;
    env.dns.fail.store(true, Ordering::SeqCst);

    env.engine
        .update_network_map(NetworkMap {
            serial: 1,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(env.engine.network_serial().await, 1);

    env.engine.stop().await.unwrap();
}

// =====================
// Sync stream
// =====================

#[tokio::test]
async fn test_sync_stream_applies_maps() {
    let env = start_engine(test_config()).await;
    let peers: Vec<RemotePeerConfig> = (0..3)
        .map(|i| RemotePeerConfig {
            public_key: KeyPair::generate().public,
            allowed_ips: vec![format!("100.64.0.1{i}/24")],
            ssh_config: None,
            fingerprint: None,
        })
        .collect();

    env.mgmt
        .push(SyncResponse {
            network_map: Some(peers_map(10, peers)),
        })
        .await;

    let engine = env.engine.clone();
    wait_until(Duration::from_secs(2), || {
        let engine = engine.clone();
        async move { engine.peer_count().await == 3 && engine.network_serial().await == 10 }
    })
    .await;

    env.engine.stop().await.unwrap();
}

// =====================
// Peer state machine over the hub
// =====================

async fn make_hub_engine(hub: Arc<LocalHub>, overlay: &str) -> Arc<Engine> {
    let mut config = EngineConfig::new("utun-hub", overlay, SecretKey::generate(), 0);
    config.ice_gathering_timeout = Duration::from_millis(500);
    let mut deps = make_deps(&config);
    deps.signal = hub;
    let engine = Engine::new(config, deps).unwrap();
    engine.start().await.unwrap();
    engine
}

#[tokio::test]
async fn test_two_engines_connect_directly() {
    let hub = LocalHub::new();

    let engine_a = make_hub_engine(hub.clone(), "100.64.0.1/24").await;
    let engine_b = make_hub_engine(hub.clone(), "100.64.0.2/24").await;

    let key_a = engine_a.public_key();
    let key_b = engine_b.public_key();

    engine_a
        .update_network_map(peers_map(1, vec![remote_peer(key_b, &["100.64.0.2/32"])]))
        .await
        .unwrap();
    engine_b
        .update_network_map(peers_map(1, vec![remote_peer(key_a, &["100.64.0.1/32"])]))
        .await
        .unwrap();

    let status_a = engine_a.status();
    let status_b = engine_b.status();
    wait_until(Duration::from_secs(5), || {
        let a = status_a.clone();
        let b = status_b.clone();
        async move { a.connected_peers() == 1 && b.connected_peers() == 1 }
    })
    .await;

    let cfg = engine_a.peer_wg_config(&key_b).await.unwrap();
    assert!(cfg.endpoint.is_some());

    engine_a.stop().await.unwrap();
    engine_b.stop().await.unwrap();
}

#[tokio::test]
async fn test_relay_fallback_when_no_candidates() {
    let hub = LocalHub::new();
    let relay = RelayManager::new();
    let proxy: SocketAddr = "127.0.0.1:3478".parse().unwrap();
    relay.set_local_proxy(Some(proxy)).await;
    relay
        .set_serve_addresses(vec!["rel.example.org:443".to_string()])
        .await;

    let driver = MockDriver::new();
    let config = test_config();
    let mut deps = make_deps(&config);
    deps.driver = driver.clone();
    deps.signal = hub.clone();
    deps.relay = relay;
    let engine = Engine::new(config, deps).unwrap();
    engine.start().await.unwrap();

    // The fake remote answers the offer claiming relay support but never
    // produces a direct candidate.
    let remote_key = KeyPair::generate().public;
    let mut remote_rx = hub.subscribe(remote_key).await.unwrap();
    let hub_for_remote = hub.clone();
    let responder = tokio::spawn(async move {
        while let Some(msg) = remote_rx.recv().await {
            if let SignalBody::Offer(_) = msg.body {
                hub_for_remote
                    .send(SignalMessage::reply(
                        &msg,
                        SignalBody::Answer(SessionDescription {
                            ufrag: "remote".to_string(),
                            pwd: "remote-pwd".to_string(),
                            relay_capable: true,
                            session_seq: 1,
                        }),
                    ))
                    .await
                    .unwrap();
            }
        }
    });

    engine
        .update_network_map(peers_map(
            1,
            vec![remote_peer(remote_key, &["100.64.0.9/32"])],
        ))
        .await
        .unwrap();

    let status = engine.status();
    wait_until(Duration::from_secs(3), || {
        let status = status.clone();
        async move { status.connected_peers() == 1 }
    })
    .await;

    let (_, endpoint) = driver.last_update_for(&remote_key).unwrap();
    assert_eq!(endpoint, Some(proxy));
    let peer_status = status
        .full_status()
        .peers
        .into_iter()
        .find(|p| p.key == remote_key)
        .unwrap();
    assert!(peer_status.relayed);

    engine.stop().await.unwrap();
    responder.abort();
}

#[tokio::test]
async fn test_driver_rejection_marks_peer_disconnected() {
    let hub = LocalHub::new();
    let driver = MockDriver::new();
    driver.reject_updates.store(true, Ordering::SeqCst);

    let config = test_config();
    let mut deps = make_deps(&config);
    deps.driver = driver.clone();
    deps.signal = hub.clone();
    let engine = Engine::new(config, deps).unwrap();
    engine.start().await.unwrap();

    let remote_key = KeyPair::generate().public;
    let mut remote_rx = hub.subscribe(remote_key).await.unwrap();
    let hub_for_remote = hub.clone();
    let responder = tokio::spawn(async move {
        while let Some(msg) = remote_rx.recv().await {
            if let SignalBody::Offer(_) = msg.body {
                let reply_to = msg.clone();
                hub_for_remote
                    .send(SignalMessage::reply(
                        &reply_to,
                        SignalBody::Answer(SessionDescription {
                            ufrag: "remote".to_string(),
                            pwd: "remote-pwd".to_string(),
                            relay_capable: false,
                            session_seq: 1,
                        }),
                    ))
                    .await
                    .unwrap();
                hub_for_remote
                    .send(SignalMessage::reply(
                        &reply_to,
                        SignalBody::Candidate(overlink_proto::IceCandidate {
                            candidate: "host 127.0.0.1:9999".to_string(),
                            addr: Some("127.0.0.1:9999".parse().unwrap()),
                            rtt_ms: None,
                        }),
                    ))
                    .await
                    .unwrap();
            }
        }
    });

    engine
        .update_network_map(peers_map(
            1,
            vec![remote_peer(remote_key, &["100.64.0.9/32"])],
        ))
        .await
        .unwrap();

    // The rejection must scope to this peer: it ends up Disconnected and
    // scheduled for redial, the engine itself keeps running.
    let status = engine.status();
    wait_until(Duration::from_secs(3), || {
        let status = status.clone();
        async move {
            status
                .full_status()
                .peers
                .iter()
                .any(|p| p.state == overlink_core::PeerState::Disconnected)
        }
    })
    .await;
    assert_eq!(engine.network_serial().await, 1);

    engine.stop().await.unwrap();
    responder.abort();
}

// =====================
// Lifecycle
// =====================

#[tokio::test]
async fn test_double_start_fails() {
    let env = start_engine(test_config()).await;
    let err = env.engine.start().await.unwrap_err();
    assert!(matches!(err, CoreError::AlreadyRunning));
    env.engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_without_start_is_safe() {
    let config = test_config();
    let deps = make_deps(&config);
    let engine = Engine::new(config, deps).unwrap();
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_update_before_start_is_rejected() {
    let config = test_config();
    let deps = make_deps(&config);
    let engine = Engine::new(config, deps).unwrap();

    let err = engine
        .update_network_map(peers_map(1, Vec::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::NotRunning));
}

#[tokio::test]
async fn test_applying_same_map_twice_is_idempotent() {
    let env = start_engine(test_config()).await;
    let peer = KeyPair::generate().public;
    let map = peers_map(3, vec![remote_peer(peer, &["100.64.0.10/24"])]);

    env.engine.update_network_map(map.clone()).await.unwrap();
    env.engine.update_network_map(map).await.unwrap();

    assert_eq!(env.engine.peer_count().await, 1);
    assert_eq!(env.engine.network_serial().await, 3);
    // The second apply is a pure no-op: one DNS call, one route call.
    assert_eq!(env.dns.calls().len(), 1);
    assert_eq!(env.routes.calls().len(), 1);

    env.engine.stop().await.unwrap();
}
