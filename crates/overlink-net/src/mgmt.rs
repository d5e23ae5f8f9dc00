//! Management service client
//!
//! The engine consumes the management plane as a pull-only stream of sync
//! messages. Opening the stream registers the node; the engine drains the
//! receiver until it closes, then reopens with backoff.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use overlink_proto::SyncResponse;

use crate::error::NetResult;

/// Capability interface of the management service.
#[async_trait]
pub trait MgmtClient: Send + Sync {
    /// Open the long-lived sync stream.
    ///
    /// A closed receiver means the stream ended; the caller decides whether
    /// to reopen. Opening again replaces any previous stream.
    async fn open_sync(&self) -> NetResult<mpsc::Receiver<SyncResponse>>;

    /// Close the client and release the session.
    async fn close(&self) -> NetResult<()>;
}

/// Management client for standalone operation: serves a fixed set of sync
/// messages (typically one network-map snapshot loaded from disk) and then
/// keeps the stream open without further updates.
pub struct StaticMgmtClient {
    messages: Vec<SyncResponse>,
    // Held so the stream stays open after the preloaded messages drain.
    sender: Mutex<Option<mpsc::Sender<SyncResponse>>>,
}

impl StaticMgmtClient {
    pub fn new(messages: Vec<SyncResponse>) -> Arc<Self> {
        Arc::new(Self {
            messages,
            sender: Mutex::new(None),
        })
    }
}

#[async_trait]
impl MgmtClient for StaticMgmtClient {
    async fn open_sync(&self) -> NetResult<mpsc::Receiver<SyncResponse>> {
        let (tx, rx) = mpsc::channel(self.messages.len().max(1));
        for msg in &self.messages {
            // Capacity covers the preload, so this cannot block.
            let _ = tx.try_send(msg.clone());
        }
        *self.sender.lock().await = Some(tx);
        Ok(rx)
    }

    async fn close(&self) -> NetResult<()> {
        self.sender.lock().await.take();
        Ok(())
    }
}
