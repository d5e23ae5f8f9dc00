//! Peer keys
//!
//! A peer is identified by its static Curve25519 public key, rendered as a
//! standard base64 string on the wire and in logs. The engine never performs
//! key exchange itself; it only carries keys between the management plane,
//! the signaling service and the tunnel driver.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::error::ProtoError;
use crate::KEY_SIZE;

/// A 32-byte peer public key.
///
/// Ordered and hashable so it can serve as a map key throughout the engine.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerKey([u8; KEY_SIZE]);

impl PeerKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Short display form for logs: the first 8 base64 characters.
    pub fn short(&self) -> String {
        let full = self.to_string();
        full.chars().take(8).collect()
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&BASE64.encode(self.0))
    }
}

impl fmt::Debug for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerKey({})", self.short())
    }
}

impl FromStr for PeerKey {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = BASE64
            .decode(s)
            .map_err(|e| ProtoError::InvalidKey(format!("{s}: {e}")))?;
        if raw.len() != KEY_SIZE {
            return Err(ProtoError::InvalidKey(format!(
                "{s}: expected {KEY_SIZE} bytes, got {}",
                raw.len()
            )));
        }
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&raw);
        Ok(Self(bytes))
    }
}

impl Serialize for PeerKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PeerKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A static Curve25519 secret key.
#[derive(Clone)]
pub struct SecretKey([u8; KEY_SIZE]);

impl SecretKey {
    /// Generate a fresh random secret key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        // Clamp per Curve25519 convention so the derived public key is valid.
        let secret = StaticSecret::from(bytes);
        Self(secret.to_bytes())
    }

    /// Wrap raw secret bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Derive the matching public key.
    pub fn public_key(&self) -> PeerKey {
        let secret = StaticSecret::from(self.0);
        let public = X25519Public::from(&secret);
        PeerKey(*public.as_bytes())
    }

    /// Render as base64 for persistence. Deliberately not `Display`, so
    /// secret material never reaches logs by accident.
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print secret material.
        f.write_str("SecretKey(..)")
    }
}

impl FromStr for SecretKey {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = BASE64
            .decode(s)
            .map_err(|e| ProtoError::InvalidKey(e.to_string()))?;
        if raw.len() != KEY_SIZE {
            return Err(ProtoError::InvalidKey(format!(
                "expected {KEY_SIZE} bytes, got {}",
                raw.len()
            )));
        }
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&raw);
        Ok(Self(bytes))
    }
}

/// A secret key together with its derived public key.
pub struct KeyPair {
    pub secret: SecretKey,
    pub public: PeerKey,
}

impl KeyPair {
    /// Generate a fresh key pair.
    pub fn generate() -> Self {
        let secret = SecretKey::generate();
        let public = secret.public_key();
        Self { secret, public }
    }
}
