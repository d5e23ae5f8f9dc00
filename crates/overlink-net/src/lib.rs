//! Overlink collaborator interfaces
//!
//! The engine talks to every subsystem through a capability trait defined
//! here: the tunnel driver, the signaling service, the management stream,
//! the DNS resolver, the route manager and the SSH server. Production
//! wiring injects real implementations; tests inject doubles satisfying
//! the same contracts.
//!
//! The crate also ships the in-memory implementations that need no OS
//! support: a userspace tunnel driver, an in-process signaling hub and the
//! relay manager handle.

pub mod dns;
pub mod error;
pub mod iface;
pub mod mgmt;
pub mod mux;
pub mod relay;
pub mod route;
pub mod signal;
pub mod ssh;
pub mod tun;

pub use dns::{DnsServer, RecordingDnsServer};
pub use error::{NetError, NetResult};
pub use iface::{IfaceLookup, StaticIfaceLookup};
pub use mgmt::{MgmtClient, StaticMgmtClient};
pub use mux::UdpMux;
pub use relay::RelayManager;
pub use route::{classify_by_public_key, AppliedRoutes, RecordingRouteManager, RouteManager};
pub use signal::{LocalHub, SignalClient};
pub use ssh::{KeyStoreServer, SshServer};
pub use tun::{IfaceAddress, PeerStats, PeerUpdate, TunnelDriver, UserspaceDriver};
