//! Peer store
//!
//! The authoritative map from peer public key to its connection object and
//! the sole owner of peer lifetime. The store has no lock of its own:
//! callers hold the engine mutex, which also guarantees at most one
//! connection object per key.

use std::collections::HashMap;
use std::sync::Arc;

use overlink_proto::PeerKey;

use crate::error::{CoreError, CoreResult};
use crate::peer::PeerConnection;

/// In-memory container of peer connections.
#[derive(Default)]
pub struct PeerStore {
    conns: HashMap<PeerKey, Arc<PeerConnection>>,
}

impl PeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection; fails if the key is already present.
    pub fn add(&mut self, key: PeerKey, conn: Arc<PeerConnection>) -> CoreResult<()> {
        if self.conns.contains_key(&key) {
            return Err(CoreError::PeerAlreadyExists(key.to_string()));
        }
        self.conns.insert(key, conn);
        Ok(())
    }

    /// Remove and return a connection; fails if the key is unknown.
    pub fn remove(&mut self, key: &PeerKey) -> CoreResult<Arc<PeerConnection>> {
        self.conns
            .remove(key)
            .ok_or_else(|| CoreError::PeerNotFound(key.to_string()))
    }

    /// Look up a connection.
    pub fn get(&self, key: &PeerKey) -> CoreResult<Arc<PeerConnection>> {
        self.conns
            .get(key)
            .cloned()
            .ok_or_else(|| CoreError::PeerNotFound(key.to_string()))
    }

    /// Whether a connection exists for the key.
    pub fn contains(&self, key: &PeerKey) -> bool {
        self.conns.contains_key(key)
    }

    /// Snapshot of the current keys; order is unspecified.
    pub fn keys(&self) -> Vec<PeerKey> {
        self.conns.keys().copied().collect()
    }

    /// Iterate over the current connections.
    pub fn iter(&self) -> impl Iterator<Item = (&PeerKey, &Arc<PeerConnection>)> {
        self.conns.iter()
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use overlink_proto::KeyPair;

    #[test]
    fn test_add_then_get() {
        let mut store = PeerStore::new();
        let key = KeyPair::generate().public;

        store.add(key, PeerConnection::stub(key)).unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.get(&key).is_ok());
        assert!(store.contains(&key));
    }

    #[test]
    fn test_double_add_fails() {
        let mut store = PeerStore::new();
        let key = KeyPair::generate().public;

        store.add(key, PeerConnection::stub(key)).unwrap();
        let err = store.add(key, PeerConnection::stub(key)).unwrap_err();
        assert!(matches!(err, CoreError::PeerAlreadyExists(_)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_remove_unknown_fails() {
        let mut store = PeerStore::new();
        let key = KeyPair::generate().public;

        let err = store.remove(&key).unwrap_err();
        assert!(matches!(err, CoreError::PeerNotFound(_)));
    }

    #[test]
    fn test_keys_snapshot() {
        let mut store = PeerStore::new();
        let a = KeyPair::generate().public;
        let b = KeyPair::generate().public;

        store.add(a, PeerConnection::stub(a)).unwrap();
        store.add(b, PeerConnection::stub(b)).unwrap();

        let mut keys = store.keys();
        keys.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(keys, expected);

        store.remove(&a).unwrap();
        assert_eq!(store.keys(), vec![b]);
        assert!(!store.is_empty());
    }
}
