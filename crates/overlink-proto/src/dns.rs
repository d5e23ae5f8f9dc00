//! DNS configuration payloads
//!
//! The engine forwards these to the resolver subsystem verbatim; record
//! resolution itself happens elsewhere.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// DNS configuration carried inside a network map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Whether the local resolver service should run at all.
    #[serde(default)]
    pub service_enable: bool,

    #[serde(default)]
    pub custom_zones: Vec<CustomZone>,

    #[serde(default)]
    pub name_server_groups: Vec<NameServerGroup>,
}

/// An authoritative zone served locally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomZone {
    /// Fully qualified zone name, trailing dot included.
    pub domain: String,

    #[serde(default)]
    pub records: Vec<SimpleRecord>,
}

/// A single resource record inside a custom zone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleRecord {
    pub name: String,
    pub record_type: i32,
    pub class: String,
    pub ttl: i64,
    pub rdata: String,
}

/// A group of upstream nameservers with matching domains.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameServerGroup {
    /// Primary groups answer everything; non-primary groups only answer
    /// their match domains.
    #[serde(default)]
    pub primary: bool,

    #[serde(default)]
    pub domains: Vec<String>,

    #[serde(default)]
    pub name_servers: Vec<NameServer>,

    #[serde(default)]
    pub search_domains_enabled: bool,
}

/// A single upstream nameserver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameServer {
    pub ip: IpAddr,
    pub ns_type: i32,
    pub port: u16,
}
