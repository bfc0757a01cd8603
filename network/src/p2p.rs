use crate::protocol::Capability;
use crate::{BlockHash, ChainWeight, NetworkError, StatusMessage};
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::bytes::Bytes;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// First frame on every connection, sent by both sides.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub node_key: [u8; 32],
    pub capabilities: Vec<Capability>,
    /// Sub-protocol carried by this connection.
    pub stream: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockAnnouncement {
    pub hash: BlockHash,
    pub height: u64,
}

/// Chain protocol messages. Block and transaction payloads are opaque to the
/// session layer and interpreted by the message handler.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum WireMessage {
    Status(StatusMessage),
    NewBlockHashes(Vec<BlockAnnouncement>),
    NewBlock {
        block: Vec<u8>,
        weight: ChainWeight,
    },
    Transactions(Vec<Vec<u8>>),
    GetBlockHeaders {
        request_id: u64,
        start: u64,
        limit: u64,
    },
    BlockHeaders {
        request_id: u64,
        headers: Vec<Vec<u8>>,
    },
    GetBlockBodies {
        request_id: u64,
        hashes: Vec<BlockHash>,
    },
    BlockBodies {
        request_id: u64,
        bodies: Vec<Vec<u8>>,
    },
    Disconnect(String),
}

impl WireMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Status(_) => "status",
            WireMessage::NewBlockHashes(_) => "new_block_hashes",
            WireMessage::NewBlock { .. } => "new_block",
            WireMessage::Transactions(_) => "transactions",
            WireMessage::GetBlockHeaders { .. } => "get_block_headers",
            WireMessage::BlockHeaders { .. } => "block_headers",
            WireMessage::GetBlockBodies { .. } => "get_block_bodies",
            WireMessage::BlockBodies { .. } => "block_bodies",
            WireMessage::Disconnect(_) => "disconnect",
        }
    }
}

/// Snapshot protocol messages carried by a satellite connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SatelliteMessage {
    GetAccountRange {
        request_id: u64,
        root: BlockHash,
        origin: BlockHash,
        limit: u64,
    },
    AccountRange {
        request_id: u64,
        accounts: Vec<Vec<u8>>,
        proof: Vec<Vec<u8>>,
    },
    GetTrieNodes {
        request_id: u64,
        root: BlockHash,
        paths: Vec<Vec<u8>>,
    },
    TrieNodes {
        request_id: u64,
        nodes: Vec<Vec<u8>>,
    },
}

/// Length-delimited bincode framing over any byte stream.
pub struct Connection<T> {
    stream: Framed<T, LengthDelimitedCodec>,
}

impl<T> Connection<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: T) -> Self {
        Self {
            stream: Framed::new(io, LengthDelimitedCodec::new()),
        }
    }

    pub async fn send<M: Serialize>(&mut self, msg: &M) -> Result<(), NetworkError> {
        let bytes = bincode::serialize(msg)?;
        self.stream.send(Bytes::from(bytes)).await?;
        Ok(())
    }

    /// Returns `Ok(None)` once the remote closed the stream.
    pub async fn recv<M: DeserializeOwned>(&mut self) -> Result<Option<M>, NetworkError> {
        let frame = match self.stream.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => return Err(e.into()),
            None => return Ok(None),
        };
        Ok(Some(bincode::deserialize(&frame)?))
    }

    /// Like `recv`, but a closed stream is an error.
    pub async fn expect<M: DeserializeOwned>(&mut self) -> Result<M, NetworkError> {
        self.recv()
            .await?
            .ok_or_else(|| NetworkError::Disconnected("connection closed".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::local_capabilities;

    #[tokio::test]
    async fn frames_round_trip_over_duplex() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut left = Connection::new(a);
        let mut right = Connection::new(b);

        let hello = Hello {
            node_key: [3u8; 32],
            capabilities: local_capabilities(true),
            stream: "chain".into(),
        };
        left.send(&hello).await.expect("send hello");
        let received: Hello = right.expect().await.expect("receive hello");
        assert_eq!(received, hello);

        right
            .send(&WireMessage::GetBlockHeaders {
                request_id: 7,
                start: 1,
                limit: 16,
            })
            .await
            .expect("send request");
        match left.expect::<WireMessage>().await.expect("receive request") {
            WireMessage::GetBlockHeaders {
                request_id,
                start,
                limit,
            } => assert_eq!((request_id, start, limit), (7, 1, 16)),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn closed_stream_reads_as_none() {
        let (a, b) = tokio::io::duplex(1024);
        let mut left = Connection::new(a);
        drop(b);
        let next: Option<WireMessage> = left.recv().await.expect("clean close");
        assert!(next.is_none());
        assert!(matches!(
            left.expect::<WireMessage>().await,
            Err(NetworkError::Disconnected(_))
        ));
    }
}
