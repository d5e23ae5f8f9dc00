//! Overlink wire-facing data model
//!
//! Types shared between the engine and its collaborators:
//! - Peer keys and key pairs
//! - Network maps issued by the management plane
//! - Route, DNS and posture-check payloads carried inside a map
//! - Signaling payloads exchanged between peers

pub mod dns;
pub mod error;
pub mod key;
pub mod mgmt;
pub mod route;
pub mod signal;

pub use dns::{CustomZone, DnsConfig, NameServer, NameServerGroup, SimpleRecord};
pub use error::ProtoError;
pub use key::{KeyPair, PeerKey, SecretKey};
pub use mgmt::{
    Checks, FirewallRule, LocalPeerConfig, NetworkMap, RemotePeerConfig, SshConfig, SyncResponse,
};
pub use route::{ClassifiedRoutes, HaId, HaMap, Route, RouteId};
pub use signal::{IceCandidate, SessionDescription, SignalBody, SignalMessage};

/// Size of a peer key in raw bytes.
pub const KEY_SIZE: usize = 32;

/// Default DNS record class carried in custom-zone records.
pub const DEFAULT_DNS_CLASS: &str = "IN";
