//! Route manager interface
//!
//! The engine classifies routes from a network map into server routes
//! (served by this node) and client routes (consumed from other peers,
//! grouped for high-availability fan-out), then hands both to the route
//! manager. Kernel routing-table manipulation lives behind the trait.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use overlink_proto::{ClassifiedRoutes, HaMap, Route, RouteId};

use crate::error::NetResult;

/// Capability interface of the route manager.
#[async_trait]
pub trait RouteManager: Send + Sync {
    /// Prepare the manager; called once during engine startup.
    async fn init(&self) -> NetResult<()>;

    /// Apply a new route set for the given network-map serial.
    async fn update_routes(
        &self,
        serial: u64,
        server_routes: HashMap<RouteId, Route>,
        client_routes: HaMap,
        use_new_dns_route: bool,
    ) -> NetResult<()>;

    /// Split routes into server and client sets.
    fn classify_routes(&self, new_routes: &[Route]) -> ClassifiedRoutes;

    /// Release resources.
    async fn stop(&self);
}

/// Classify routes by comparing each route's configured peer against the
/// local public key: matches are server routes, the rest are grouped into
/// the client HA map.
pub fn classify_by_public_key(new_routes: &[Route], local_key: &str) -> ClassifiedRoutes {
    let mut classified = ClassifiedRoutes::default();
    for route in new_routes {
        if route.peer == local_key {
            classified
                .server_routes
                .insert(route.id.clone(), route.clone());
        } else {
            classified
                .client_routes
                .entry(route.ha_unique_id())
                .or_default()
                .push(route.clone());
        }
    }
    classified
}

/// Reference route manager.
///
/// Classifies against the local key and retains the last applied update for
/// status surfaces; platform routing tables are out of its scope.
pub struct RecordingRouteManager {
    local_key: String,
    last: Mutex<Option<AppliedRoutes>>,
}

/// The most recently applied route update.
#[derive(Debug, Clone, Default)]
pub struct AppliedRoutes {
    pub serial: u64,
    pub server_routes: HashMap<RouteId, Route>,
    pub client_routes: HaMap,
}

impl RecordingRouteManager {
    pub fn new(local_key: String) -> Arc<Self> {
        Arc::new(Self {
            local_key,
            last: Mutex::new(None),
        })
    }

    pub async fn last_applied(&self) -> Option<AppliedRoutes> {
        self.last.lock().await.clone()
    }
}

#[async_trait]
impl RouteManager for RecordingRouteManager {
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
        debug!(
            serial,
            server = server_routes.len(),
            client_groups = client_routes.len(),
            "applying route update"
        );
        *self.last.lock().await = Some(AppliedRoutes {
            serial,
            server_routes,
            client_routes,
        });
        Ok(())
    }

    fn classify_routes(&self, new_routes: &[Route]) -> ClassifiedRoutes {
        classify_by_public_key(new_routes, &self.local_key)
    }

    async fn stop(&self) {
        self.last.lock().await.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(id: &str, net: &str, net_id: &str, peer: &str) -> Route {
        Route {
            id: id.to_string(),
            network: net.parse().unwrap(),
            net_id: net_id.to_string(),
            peer: peer.to_string(),
            network_type: 1,
            masquerade: false,
            metric: 9999,
        }
    }

    #[test]
    fn test_classify_splits_on_local_key() {
        let routes = vec![
            route("a", "192.168.0.0/24", "n1", "local"),
            route("b", "192.168.1.0/24", "n2", "remote"),
            route("c", "192.168.1.0/24", "n2", "remote2"),
        ];

        let classified = classify_by_public_key(&routes, "local");
        assert_eq!(classified.server_routes.len(), 1);
        assert!(classified.server_routes.contains_key("a"));

        assert_eq!(classified.client_routes.len(), 1);
        let group = &classified.client_routes["n2|192.168.1.0/24"];
        assert_eq!(group.len(), 2);
    }
}
