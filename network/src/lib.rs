use fork_id::{EntryError, ForkIdError};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

pub mod discovery;
pub mod handshake;
pub mod p2p;
pub mod peer;
pub mod protocol;
pub mod registry;
pub mod rendezvous;
pub mod service;
pub mod session;

pub use discovery::LocalRecord;
pub use handshake::{StatusMessage, StatusSource};
pub use p2p::{Connection, Hello, SatelliteMessage, WireMessage};
pub use peer::{Peer, PeerInfo, SatelliteInfo, SatellitePeer};
pub use protocol::Capability;
pub use registry::PeerRegistry;
pub use rendezvous::SatelliteRendezvous;
pub use service::{P2PConfig, P2PService};
pub use session::{MessageHandler, SessionConfig, SessionContext};

pub type PeerId = [u8; 32];
pub type BlockHash = [u8; 32];

/// Derives the network-wide peer identity from a node public key.
pub fn peer_id_from_key(node_key: &[u8; 32]) -> PeerId {
    let mut hasher = Sha256::new();
    hasher.update(node_key);
    let mut id = [0u8; 32];
    id.copy_from_slice(&hasher.finalize());
    id
}

/// Abbreviated hex form of a peer id for log lines.
pub fn short_id(id: &PeerId) -> String {
    hex::encode(&id[..8])
}

/// Self-reported total chain weight. Only ever compared, never recomputed.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChainWeight(pub BigUint);

impl ChainWeight {
    pub fn zero() -> Self {
        Self(BigUint::default())
    }
}

impl From<u64> for ChainWeight {
    fn from(value: u64) -> Self {
        Self(BigUint::from(value))
    }
}

impl fmt::Display for ChainWeight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("peer {} is already registered", short_id(.0))]
    DuplicateIdentity(PeerId),
    #[error("peer limit of {0} reached")]
    TooManyPeers(usize),
    #[error("network id mismatch: local {local}, remote {remote}")]
    IncompatibleNetwork { local: u64, remote: u64 },
    #[error("genesis mismatch: local {}, remote {}", hex::encode(.local), hex::encode(.remote))]
    GenesisMismatch { local: BlockHash, remote: BlockHash },
    #[error("protocol version mismatch: local {local}, remote {remote}")]
    ProtocolVersionMismatch { local: u32, remote: u32 },
    #[error("incompatible fork: {0}")]
    IncompatibleFork(#[from] ForkIdError),
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("unexpected message: {0}")]
    UnexpectedMessage(&'static str),
    #[error("satellite pairing rejected for peer {}", short_id(.0))]
    PairingRejected(PeerId),
    #[error("disconnected: {0}")]
    Disconnected(String),
    #[error("handler error: {0}")]
    Handler(String),
    #[error("discovery entry error: {0}")]
    Entry(#[from] EntryError),
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_is_stable_for_a_key() {
        let key = [7u8; 32];
        assert_eq!(peer_id_from_key(&key), peer_id_from_key(&key));
        assert_ne!(peer_id_from_key(&key), peer_id_from_key(&[8u8; 32]));
    }

    #[test]
    fn chain_weight_orders_numerically() {
        let small = ChainWeight::from(9);
        let large = ChainWeight(BigUint::from(u64::MAX) * 2u32);
        assert!(large > small);
        assert!(small > ChainWeight::zero());
        assert_eq!(small.to_string(), "9");
    }
}
