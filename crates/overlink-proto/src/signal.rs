//! Signaling payloads
//!
//! Peers exchange session offers, answers and path candidates through a
//! publish/subscribe signaling service keyed by peer public key. Delivery
//! is at-least-once; consumers treat duplicates as idempotent.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::key::PeerKey;

/// An addressed signaling message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalMessage {
    pub from: PeerKey,
    pub to: PeerKey,
    pub body: SignalBody,
}

/// Signaling message payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SignalBody {
    /// Dial request carrying the initiator's session credentials.
    Offer(SessionDescription),
    /// Dial response carrying the responder's session credentials.
    Answer(SessionDescription),
    /// One path candidate discovered during gathering.
    Candidate(IceCandidate),
    /// Relay service addresses the sender can be reached through.
    RelayAddrs(Vec<String>),
}

/// Session credentials exchanged in offers and answers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Session username fragment.
    pub ufrag: String,
    /// Session password.
    pub pwd: String,
    /// Whether the sender can accept relayed paths.
    #[serde(default)]
    pub relay_capable: bool,
    /// Monotonic session counter; a higher value supersedes earlier
    /// sessions and forces a restart of candidate selection.
    #[serde(default)]
    pub session_seq: u64,
}

/// One candidate path towards the sending peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Raw candidate line as produced by the gatherer.
    pub candidate: String,
    /// Resolved address, when the gatherer already resolved one.
    #[serde(default)]
    pub addr: Option<SocketAddr>,
    /// Round-trip estimate from connectivity checks, when available.
    #[serde(default)]
    pub rtt_ms: Option<u32>,
}

impl SignalMessage {
    /// Convenience constructor flipping the address pair of `msg`.
    pub fn reply(to: &SignalMessage, body: SignalBody) -> Self {
        Self {
            from: to.to,
            to: to.from,
            body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KeyPair;

    #[test]
    fn test_reply_flips_addressing() {
        let a = KeyPair::generate().public;
        let b = KeyPair::generate().public;
        let offer = SignalMessage {
            from: a,
            to: b,
            body: SignalBody::Offer(SessionDescription::default()),
        };

        let answer = SignalMessage::reply(&offer, SignalBody::Answer(SessionDescription::default()));
        assert_eq!(answer.from, b);
        assert_eq!(answer.to, a);
    }
}
