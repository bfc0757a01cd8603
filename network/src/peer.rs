use crate::p2p::{SatelliteMessage, WireMessage};
use crate::protocol::Capability;
use crate::{BlockHash, ChainWeight, NetworkError, PeerId, short_id};
use fork_id::ForkId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

/// Chain protocol metadata reported for a connected peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub version: u32,
    pub weight: String,
    pub head: String,
}

/// Snapshot protocol metadata reported for a connected peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SatelliteInfo {
    pub version: u32,
}

/// Snapshot-protocol connection paired with a primary chain connection.
#[derive(Clone)]
pub struct SatellitePeer {
    id: PeerId,
    version: u32,
    sender: mpsc::Sender<SatelliteMessage>,
    close: CancellationToken,
}

impl SatellitePeer {
    pub fn new(
        id: PeerId,
        version: u32,
        sender: mpsc::Sender<SatelliteMessage>,
        close: CancellationToken,
    ) -> Self {
        Self {
            id,
            version,
            sender,
            close,
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub async fn send(&self, msg: SatelliteMessage) -> Result<(), NetworkError> {
        self.sender
            .send(msg)
            .await
            .map_err(|_| NetworkError::Disconnected("satellite session closed".into()))
    }

    /// Ends the satellite session.
    pub fn close(&self) {
        self.close.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled() || self.sender.is_closed()
    }

    /// Resolves once the satellite session has ended or been closed.
    pub async fn closed(&self) {
        self.close.cancelled().await
    }

    pub fn info(&self) -> SatelliteInfo {
        SatelliteInfo {
            version: self.version,
        }
    }
}

impl fmt::Debug for SatellitePeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SatellitePeer")
            .field("id", &short_id(&self.id))
            .field("version", &self.version)
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerHead {
    pub hash: BlockHash,
    pub weight: ChainWeight,
}

/// A connected, handshaken chain-protocol peer.
pub struct Peer {
    id: PeerId,
    version: u32,
    capabilities: Vec<Capability>,
    fork_id: ForkId,
    head: RwLock<PeerHead>,
    sender: mpsc::Sender<WireMessage>,
    satellite: Option<SatellitePeer>,
}

impl Peer {
    pub fn new(
        id: PeerId,
        version: u32,
        capabilities: Vec<Capability>,
        fork_id: ForkId,
        head: PeerHead,
        sender: mpsc::Sender<WireMessage>,
        satellite: Option<SatellitePeer>,
    ) -> Self {
        Self {
            id,
            version,
            capabilities,
            fork_id,
            head: RwLock::new(head),
            sender,
            satellite,
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    pub fn fork_id(&self) -> ForkId {
        self.fork_id
    }

    pub fn satellite(&self) -> Option<&SatellitePeer> {
        self.satellite.as_ref()
    }

    pub fn head(&self) -> PeerHead {
        self.head.read().clone()
    }

    pub fn weight(&self) -> ChainWeight {
        self.head.read().weight.clone()
    }

    /// Records a newer head announced by the peer.
    pub fn set_head(&self, hash: BlockHash, weight: ChainWeight) {
        *self.head.write() = PeerHead { hash, weight };
    }

    /// Queues a message for the session writer.
    pub async fn send(&self, msg: WireMessage) -> Result<(), NetworkError> {
        self.sender
            .send(msg)
            .await
            .map_err(|_| NetworkError::Disconnected("peer session closed".into()))
    }

    /// Queues a message without waiting for buffer space. Used for
    /// broadcasts, where a slow peer should not stall the sender.
    pub fn try_send(&self, msg: WireMessage) -> Result<(), NetworkError> {
        self.sender.try_send(msg).map_err(|err| match err {
            TrySendError::Full(_) => NetworkError::Disconnected("outbound queue full".into()),
            TrySendError::Closed(_) => NetworkError::Disconnected("peer session closed".into()),
        })
    }

    pub fn info(&self) -> PeerInfo {
        let head = self.head.read();
        PeerInfo {
            version: self.version,
            weight: head.weight.to_string(),
            head: hex::encode(head.hash),
        }
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &short_id(&self.id))
            .field("version", &self.version)
            .field("weight", &self.weight())
            .field("satellite", &self.satellite)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn test_peer(seed: u8, weight: u64) -> (Peer, mpsc::Receiver<WireMessage>) {
        let (tx, rx) = mpsc::channel(8);
        let peer = Peer::new(
            [seed; 32],
            67,
            Vec::new(),
            ForkId {
                hash: [0; 4],
                next: 0,
            },
            PeerHead {
                hash: [seed; 32],
                weight: ChainWeight::from(weight),
            },
            tx,
            None,
        );
        (peer, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::test_peer;
    use super::*;

    #[test]
    fn info_reports_head_and_weight() {
        let (peer, _rx) = test_peer(0xab, 1234);
        let info = peer.info();
        assert_eq!(info.version, 67);
        assert_eq!(info.weight, "1234");
        assert_eq!(info.head, hex::encode([0xab; 32]));

        peer.set_head([0xcd; 32], ChainWeight::from(5000));
        assert_eq!(peer.weight(), ChainWeight::from(5000));
        assert_eq!(peer.info().head, hex::encode([0xcd; 32]));
    }

    #[tokio::test]
    async fn send_fails_once_session_is_gone() {
        let (peer, mut rx) = test_peer(1, 0);
        peer.send(WireMessage::Transactions(vec![vec![1]]))
            .await
            .expect("queue open");
        assert!(matches!(rx.recv().await, Some(WireMessage::Transactions(_))));

        drop(rx);
        assert!(matches!(
            peer.send(WireMessage::Transactions(Vec::new())).await,
            Err(NetworkError::Disconnected(_))
        ));
        assert!(peer.try_send(WireMessage::Transactions(Vec::new())).is_err());
    }

    #[test]
    fn satellite_close_cancels_token() {
        let (tx, _rx) = mpsc::channel(1);
        let token = CancellationToken::new();
        let satellite = SatellitePeer::new([2; 32], 1, tx, token.clone());
        assert!(!satellite.is_closed());
        satellite.close();
        assert!(token.is_cancelled());
        assert_eq!(satellite.info(), SatelliteInfo { version: 1 });
    }
}
