//! Network routes
//!
//! Routes distributed by management either terminate at this node (server
//! routes) or point at another peer (client routes). Client routes pointing
//! at the same network form a high-availability group keyed by
//! `<net_id>|<network>`.

use std::collections::HashMap;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// Opaque route identifier assigned by management.
pub type RouteId = String;

/// High-availability group identifier: `<net_id>|<network>`.
pub type HaId = String;

/// Client routes grouped by HA identifier; each group fans out across the
/// peers able to serve the same network.
pub type HaMap = HashMap<HaId, Vec<Route>>;

/// A single route entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub id: RouteId,

    /// Destination network.
    pub network: IpNet,

    /// Logical network name grouping HA members.
    pub net_id: String,

    /// Public key (base64) of the peer serving the route.
    pub peer: String,

    pub network_type: i32,

    #[serde(default)]
    pub masquerade: bool,

    #[serde(default)]
    pub metric: i64,
}

impl Route {
    /// The HA group this route belongs to.
    pub fn ha_unique_id(&self) -> HaId {
        format!("{}|{}", self.net_id, self.network)
    }
}

/// Routes split into those this node serves and those it consumes.
#[derive(Debug, Clone, Default)]
pub struct ClassifiedRoutes {
    /// Routes whose configured peer is the local node.
    pub server_routes: HashMap<RouteId, Route>,

    /// Routes served by other peers, grouped for HA fan-out.
    pub client_routes: HaMap,
}
