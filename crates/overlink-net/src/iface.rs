//! Local interface lookup
//!
//! NAT external-IP mappings may name a local interface instead of an IP;
//! resolving the name to the interface's first usable IPv4 is OS plumbing,
//! so it sits behind a trait. The embedder supplies the platform
//! implementation; `StaticIfaceLookup` serves configs and tests.

use std::collections::HashMap;
use std::net::Ipv4Addr;

/// Resolves local interface names to addresses.
pub trait IfaceLookup: Send + Sync {
    /// First non-loopback IPv4 address of `name`, if the interface exists
    /// and carries one.
    fn first_ipv4(&self, name: &str) -> Option<Ipv4Addr>;

    /// Whether an interface with this name exists at all.
    fn exists(&self, name: &str) -> bool;
}

/// Interface table built from static configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticIfaceLookup {
    entries: HashMap<String, Vec<Ipv4Addr>>,
}

impl StaticIfaceLookup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an interface with its addresses, loopbacks included.
    pub fn with_iface(mut self, name: &str, addrs: Vec<Ipv4Addr>) -> Self {
        self.entries.insert(name.to_string(), addrs);
        self
    }
}

impl IfaceLookup for StaticIfaceLookup {
    fn first_ipv4(&self, name: &str) -> Option<Ipv4Addr> {
        self.entries
            .get(name)?
            .iter()
            .find(|ip| !ip.is_loopback())
            .copied()
    }

    fn exists(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }
}
