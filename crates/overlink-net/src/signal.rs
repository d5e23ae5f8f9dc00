//! Signaling service client
//!
//! A publish/subscribe channel keyed by peer public key carrying session
//! offers, answers and path candidates. Delivery is at-least-once, so
//! consumers must tolerate duplicates.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use overlink_proto::{PeerKey, SignalMessage};

use crate::error::{NetError, NetResult};

/// Capacity of a per-subscriber delivery queue.
const SUBSCRIBER_QUEUE: usize = 256;

/// Capability interface of the signaling service.
#[async_trait]
pub trait SignalClient: Send + Sync {
    /// Subscribe to messages addressed to `key`. Only one subscription per
    /// key is active; resubscribing replaces the previous stream.
    async fn subscribe(&self, key: PeerKey) -> NetResult<mpsc::Receiver<SignalMessage>>;

    /// Publish a message towards its `to` key.
    async fn send(&self, msg: SignalMessage) -> NetResult<()>;

    /// Whether the client currently has a live stream to the service.
    fn is_ready(&self) -> bool;
}

/// In-process signaling hub.
///
/// Routes messages between engines living in the same process: the test
/// suites and the standalone daemon run entire meshes against it.
#[derive(Default)]
pub struct LocalHub {
    subscribers: Mutex<HashMap<PeerKey, mpsc::Sender<SignalMessage>>>,
}

impl LocalHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl SignalClient for LocalHub {
    async fn subscribe(&self, key: PeerKey) -> NetResult<mpsc::Receiver<SignalMessage>> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let previous = self.subscribers.lock().await.insert(key, tx);
        if previous.is_some() {
            debug!(peer = %key.short(), "replaced existing signal subscription");
        }
        Ok(rx)
    }

    async fn send(&self, msg: SignalMessage) -> NetResult<()> {
        let target = {
            let subs = self.subscribers.lock().await;
            subs.get(&msg.to).cloned()
        };

        match target {
            Some(tx) => tx
                .send(msg)
                .await
                .map_err(|_| NetError::Signal("subscriber gone".to_string())),
            None => {
                // The peer may simply not have registered yet; signaling is
                // best-effort and the dialer retries.
                warn!(peer = %msg.to.short(), "dropping signal for unknown peer");
                Ok(())
            }
        }
    }

    fn is_ready(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use overlink_proto::{KeyPair, SessionDescription, SignalBody};

    #[tokio::test]
    async fn test_routes_to_subscriber() {
        let hub = LocalHub::new();
        let a = KeyPair::generate().public;
        let b = KeyPair::generate().public;

        let mut rx = hub.subscribe(b).await.unwrap();
        hub.send(SignalMessage {
            from: a,
            to: b,
            body: SignalBody::Offer(SessionDescription::default()),
        })
        .await
        .unwrap();

        let got = rx.recv().await.unwrap();
        assert_eq!(got.from, a);
    }

    #[tokio::test]
    async fn test_unknown_target_is_dropped() {
        let hub = LocalHub::new();
        let a = KeyPair::generate().public;
        let b = KeyPair::generate().public;

        // no subscriber for b; must not error
        hub.send(SignalMessage {
            from: a,
            to: b,
            body: SignalBody::RelayAddrs(vec![]),
        })
        .await
        .unwrap();
    }
}
