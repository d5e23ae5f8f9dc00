//! Overlink client core
//!
//! The reconciliation engine of the overlay VPN client:
//! - keeps a long-lived sync stream to the management service
//! - owns the per-peer connection state machines and their lifecycle
//! - selects between direct and relayed paths per peer
//! - applies network-map updates atomically under a monotonic serial

pub mod backoff;
pub mod checks;
pub mod config;
pub mod conn_mgr;
pub mod engine;
pub mod error;
pub mod nat;
pub mod peer;
pub mod peer_store;
pub mod status;

pub use checks::is_checks_equal;
pub use config::EngineConfig;
pub use conn_mgr::ConnMgr;
pub use engine::{Engine, EngineDeps, SshServerFactory};
pub use error::{CoreError, CoreResult};
pub use nat::parse_nat_external_ip_mappings;
pub use peer::{PeerConnection, PeerInput, PeerWgConfig};
pub use peer_store::PeerStore;
pub use status::{FullStatus, PeerState, PeerStatus, Recorder};

/// Ceiling for the management sync-stream reconnect backoff.
pub const SYNC_BACKOFF_CEILING_SECS: u64 = 60;

/// Default persistent-keepalive interval for driver peer entries.
pub const DEFAULT_KEEPALIVE_SECS: u64 = 25;
