//! DNS resolver interface

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use overlink_proto::DnsConfig;

use crate::error::NetResult;

/// Capability interface of the local DNS resolver subsystem.
///
/// The engine forwards custom zones and nameserver groups; resolution logic
/// lives behind this trait.
#[async_trait]
pub trait DnsServer: Send + Sync {
    /// Apply a new DNS configuration for the given network-map serial.
    async fn update(&self, serial: u64, config: DnsConfig) -> NetResult<()>;

    /// Stop serving and release resources.
    async fn stop(&self);
}

/// Reference DNS server retaining the last applied configuration for
/// status surfaces; actual resolution is platform plumbing provided by the
/// embedder.
#[derive(Default)]
pub struct RecordingDnsServer {
    last: Mutex<Option<(u64, DnsConfig)>>,
}

impl RecordingDnsServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn last_applied(&self) -> Option<(u64, DnsConfig)> {
        self.last.lock().await.clone()
    }
}

#[async_trait]
impl DnsServer for RecordingDnsServer {
    async fn update(&self, serial: u64, config: DnsConfig) -> NetResult<()> {
        debug!(
            serial,
            zones = config.custom_zones.len(),
            groups = config.name_server_groups.len(),
            "applying dns update"
        );
        *self.last.lock().await = Some((serial, config));
        Ok(())
    }

    async fn stop(&self) {
        self.last.lock().await.take();
    }
}
