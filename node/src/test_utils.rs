//! In-memory collaborators for tests: a chain store, a block server that
//! doubles as the message handler, and two downloaders.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use fork_id::ForkId;
use network::peer::PeerHead;
use network::{
    BlockHash, ChainWeight, MessageHandler, NetworkError, Peer, PeerId, SatelliteMessage,
    SatellitePeer, WireMessage,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::timeout;
use tracing::debug;

use crate::chain::{ChainHead, ChainStore, HeadEvent};
use crate::config::NodeConfig;
use crate::downloader::{DownloadError, Downloader, SyncMode, SyncOperation};

const MAX_HEADERS: u64 = 256;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestBlock {
    pub height: u64,
    pub hash: BlockHash,
    pub parent: BlockHash,
    pub difficulty: u64,
}

impl TestBlock {
    fn child_of(parent: &TestBlock) -> Self {
        let height = parent.height + 1;
        Self {
            height,
            hash: block_hash(&parent.hash, height),
            parent: parent.hash,
            difficulty: 1,
        }
    }
}

fn block_hash(parent: &BlockHash, height: u64) -> BlockHash {
    let mut hasher = Sha256::new();
    hasher.update(b"test-block");
    hasher.update(parent);
    hasher.update(height.to_be_bytes());
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&hasher.finalize());
    hash
}

fn genesis() -> TestBlock {
    TestBlock {
        height: 0,
        hash: block_hash(&[0u8; 32], 0),
        parent: [0u8; 32],
        difficulty: 1,
    }
}

struct ChainState {
    blocks: Vec<TestBlock>,
    total_difficulty: u64,
}

/// Linear chain held in memory. Every block has difficulty 1, so the chain
/// weight is `height + 1`.
pub struct MemoryChain {
    state: RwLock<ChainState>,
    heads: Mutex<Option<broadcast::Sender<HeadEvent>>>,
}

impl Default for MemoryChain {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryChain {
    pub fn new() -> Self {
        let (heads, _) = broadcast::channel(64);
        let genesis = genesis();
        Self {
            state: RwLock::new(ChainState {
                total_difficulty: genesis.difficulty,
                blocks: vec![genesis],
            }),
            heads: Mutex::new(Some(heads)),
        }
    }

    /// Chain with `count` blocks on top of genesis.
    pub fn with_blocks(count: u64) -> Self {
        let chain = Self::new();
        {
            let mut state = chain.state.write();
            for _ in 0..count {
                let next = match state.blocks.last() {
                    Some(tip) => TestBlock::child_of(tip),
                    None => genesis(),
                };
                state.total_difficulty += next.difficulty;
                state.blocks.push(next);
            }
        }
        chain
    }

    pub fn blocks_from(&self, start: u64, limit: u64) -> Vec<TestBlock> {
        let state = self.state.read();
        state
            .blocks
            .iter()
            .skip(start as usize)
            .take(limit as usize)
            .cloned()
            .collect()
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.state.read().blocks.iter().any(|block| &block.hash == hash)
    }

    /// Appends blocks that extend the current head. Returns how many were
    /// added. A batch with any invalid block leaves the chain untouched.
    pub fn import(&self, blocks: Vec<TestBlock>) -> Result<usize, DownloadError> {
        let count = blocks.len();
        let event = {
            let mut state = self.state.write();
            let Some(mut tip) = state.blocks.last() else {
                return Err(DownloadError::Invalid("chain has no genesis".into()));
            };
            for block in &blocks {
                if block.height != tip.height + 1 || block.parent != tip.hash {
                    return Err(DownloadError::Invalid(format!(
                        "block {} does not extend head {}",
                        block.height, tip.height
                    )));
                }
                if block.hash != block_hash(&block.parent, block.height) {
                    return Err(DownloadError::Invalid(format!(
                        "block {} has a bad hash",
                        block.height
                    )));
                }
                tip = block;
            }
            for block in blocks {
                state.total_difficulty += block.difficulty;
                state.blocks.push(block);
            }
            state.blocks.last().map(|tip| HeadEvent {
                hash: tip.hash,
                height: tip.height,
            })
        };
        if count > 0
            && let Some(event) = event
            && let Some(heads) = self.heads.lock().as_ref()
        {
            let _ = heads.send(event);
        }
        Ok(count)
    }

    /// Stops head notifications; subscribers see the channel close.
    pub fn close(&self) {
        self.heads.lock().take();
    }
}

impl ChainStore for MemoryChain {
    fn genesis_hash(&self) -> BlockHash {
        self.state.read().blocks[0].hash
    }

    fn head(&self) -> ChainHead {
        let state = self.state.read();
        let (hash, height) = state
            .blocks
            .last()
            .map(|tip| (tip.hash, tip.height))
            .unwrap_or_default();
        ChainHead {
            hash,
            height,
            weight: ChainWeight::from(state.total_difficulty),
        }
    }

    fn canonical_hash(&self, height: u64) -> Option<BlockHash> {
        self.state
            .read()
            .blocks
            .get(height as usize)
            .map(|block| block.hash)
    }

    fn subscribe_head(&self) -> broadcast::Receiver<HeadEvent> {
        match self.heads.lock().as_ref() {
            Some(heads) => heads.subscribe(),
            None => broadcast::channel(1).1,
        }
    }
}

enum Response {
    Chain(WireMessage),
    Snap(SatelliteMessage),
}

/// Serves the local chain to peers and routes responses to requests made
/// through [`ChainServer::request_headers`] and friends.
pub struct ChainServer {
    chain: Arc<MemoryChain>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Response>>>,
    next_request: AtomicU64,
    request_timeout: Duration,
    served_snapshots: AtomicU64,
}

impl ChainServer {
    pub fn new(chain: Arc<MemoryChain>) -> Self {
        Self {
            chain,
            pending: Mutex::new(HashMap::new()),
            next_request: AtomicU64::new(1),
            request_timeout: Duration::from_secs(5),
            served_snapshots: AtomicU64::new(0),
        }
    }

    /// Account range requests answered over satellite connections.
    pub fn served_snapshots(&self) -> u64 {
        self.served_snapshots.load(Ordering::Relaxed)
    }

    fn open_request(&self) -> (u64, oneshot::Receiver<Response>) {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id, tx);
        (request_id, rx)
    }

    fn complete(&self, request_id: u64, response: Response) {
        match self.pending.lock().remove(&request_id) {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => debug!(request_id, "dropping unsolicited response"),
        }
    }

    async fn await_response(
        &self,
        request_id: u64,
        rx: oneshot::Receiver<Response>,
    ) -> Result<Response, DownloadError> {
        match timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(DownloadError::Peer("request abandoned".into())),
            Err(_) => {
                self.pending.lock().remove(&request_id);
                Err(DownloadError::Peer(format!("request {request_id} timed out")))
            }
        }
    }

    pub async fn request_headers(
        &self,
        peer: &Peer,
        start: u64,
        limit: u64,
    ) -> Result<Vec<TestBlock>, DownloadError> {
        let (request_id, rx) = self.open_request();
        peer.send(WireMessage::GetBlockHeaders {
            request_id,
            start,
            limit,
        })
        .await?;
        match self.await_response(request_id, rx).await? {
            Response::Chain(WireMessage::BlockHeaders { headers, .. }) => headers
                .iter()
                .map(|raw| {
                    bincode::deserialize(raw).map_err(|err| DownloadError::Invalid(err.to_string()))
                })
                .collect(),
            _ => Err(DownloadError::Peer("unexpected response to header request".into())),
        }
    }

    pub async fn request_account_range(
        &self,
        satellite: &SatellitePeer,
        root: BlockHash,
    ) -> Result<usize, DownloadError> {
        let (request_id, rx) = self.open_request();
        satellite
            .send(SatelliteMessage::GetAccountRange {
                request_id,
                root,
                origin: [0u8; 32],
                limit: 1024,
            })
            .await?;
        match self.await_response(request_id, rx).await? {
            Response::Snap(SatelliteMessage::AccountRange { accounts, .. }) => Ok(accounts.len()),
            _ => Err(DownloadError::Peer("unexpected response to account range request".into())),
        }
    }
}

#[async_trait]
impl MessageHandler for ChainServer {
    async fn handle_message(&self, peer: &Arc<Peer>, msg: WireMessage) -> Result<(), NetworkError> {
        match msg {
            WireMessage::GetBlockHeaders {
                request_id,
                start,
                limit,
            } => {
                let headers = self
                    .chain
                    .blocks_from(start, limit.min(MAX_HEADERS))
                    .iter()
                    .map(bincode::serialize)
                    .collect::<Result<Vec<_>, _>>()?;
                peer.send(WireMessage::BlockHeaders {
                    request_id,
                    headers,
                })
                .await
            }
            WireMessage::GetBlockBodies { request_id, hashes } => {
                let bodies = hashes
                    .iter()
                    .filter(|hash| self.chain.contains(hash))
                    .map(|_| Vec::new())
                    .collect();
                peer.send(WireMessage::BlockBodies { request_id, bodies })
                    .await
            }
            WireMessage::NewBlock { block, weight } => {
                let block: TestBlock = bincode::deserialize(&block)?;
                peer.set_head(block.hash, weight);
                Ok(())
            }
            WireMessage::BlockHeaders { request_id, .. }
            | WireMessage::BlockBodies { request_id, .. } => {
                self.complete(request_id, Response::Chain(msg));
                Ok(())
            }
            other => {
                debug!(kind = other.kind(), "ignoring message");
                Ok(())
            }
        }
    }

    async fn handle_satellite(
        &self,
        _peer_id: &PeerId,
        satellite: &SatellitePeer,
        msg: SatelliteMessage,
    ) -> Result<(), NetworkError> {
        match msg {
            SatelliteMessage::GetAccountRange { request_id, .. } => {
                self.served_snapshots.fetch_add(1, Ordering::Relaxed);
                satellite
                    .send(SatelliteMessage::AccountRange {
                        request_id,
                        accounts: Vec::new(),
                        proof: Vec::new(),
                    })
                    .await
            }
            SatelliteMessage::GetTrieNodes { request_id, .. } => {
                satellite
                    .send(SatelliteMessage::TrieNodes {
                        request_id,
                        nodes: Vec::new(),
                    })
                    .await
            }
            SatelliteMessage::AccountRange { request_id, .. }
            | SatelliteMessage::TrieNodes { request_id, .. } => {
                self.complete(request_id, Response::Snap(msg));
                Ok(())
            }
        }
    }
}

/// Header-by-header downloader over the chain protocol. In snapshot mode it
/// first pulls an account range over the peer's satellite, when present.
pub struct BlockFetcher {
    chain: Arc<MemoryChain>,
    server: Arc<ChainServer>,
    batch: u64,
}

impl BlockFetcher {
    pub fn new(chain: Arc<MemoryChain>, server: Arc<ChainServer>) -> Self {
        Self {
            chain,
            server,
            batch: 128,
        }
    }
}

#[async_trait]
impl Downloader for BlockFetcher {
    async fn run_sync(&self, op: SyncOperation) -> Result<bool, DownloadError> {
        if op.mode == SyncMode::SnapshotSync
            && let Some(satellite) = op.peer.satellite()
        {
            let root = op.peer.head().hash;
            let accounts = self.server.request_account_range(satellite, root).await?;
            debug!(accounts, "fetched snapshot account range");
        }

        let mut imported = false;
        loop {
            if op.cancel.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            let head = self.chain.head();
            if head.weight >= op.peer.weight() {
                break;
            }
            let blocks = self
                .server
                .request_headers(&op.peer, head.height + 1, self.batch)
                .await?;
            if blocks.is_empty() {
                break;
            }
            self.chain.import(blocks)?;
            imported = true;
        }
        Ok(imported)
    }
}

enum Step {
    Finish(Result<bool, DownloadError>),
    Hang,
    Import(Arc<MemoryChain>, Vec<TestBlock>),
}

/// Downloader that replays queued outcomes and records every call. An empty
/// script finishes with `Ok(false)`.
#[derive(Default)]
pub struct ScriptedDownloader {
    script: Mutex<VecDeque<Step>>,
    calls: Mutex<Vec<(PeerId, SyncMode)>>,
}

impl ScriptedDownloader {
    pub fn push(&self, outcome: Result<bool, DownloadError>) {
        self.script.lock().push_back(Step::Finish(outcome));
    }

    /// Next call blocks until its operation is cancelled.
    pub fn push_hang(&self) {
        self.script.lock().push_back(Step::Hang);
    }

    /// Next call imports `blocks` into `chain`.
    pub fn push_import(&self, chain: Arc<MemoryChain>, blocks: Vec<TestBlock>) {
        self.script.lock().push_back(Step::Import(chain, blocks));
    }

    pub fn calls(&self) -> Vec<(PeerId, SyncMode)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Downloader for ScriptedDownloader {
    async fn run_sync(&self, op: SyncOperation) -> Result<bool, DownloadError> {
        self.calls.lock().push((*op.peer.id(), op.mode));
        let step = self.script.lock().pop_front();
        match step {
            None => Ok(false),
            Some(Step::Finish(outcome)) => outcome,
            Some(Step::Hang) => {
                op.cancel.cancelled().await;
                Err(DownloadError::Cancelled)
            }
            Some(Step::Import(chain, blocks)) => chain.import(blocks).map(|count| count > 0),
        }
    }
}

/// Unregistered peer with a fixed head weight, plus the receiving end of its
/// outbound queue.
pub fn test_peer(seed: u8, weight: u64) -> (Arc<Peer>, mpsc::Receiver<WireMessage>) {
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
    (Arc::new(peer), rx)
}

/// Listener-less config with short timers.
pub fn test_config(seed: u8) -> NodeConfig {
    NodeConfig {
        node_key: [seed; 32],
        p2p_addr: None,
        sync_interval: Duration::from_millis(200),
        pairing_timeout: Duration::from_secs(2),
        handshake_timeout: Duration::from_secs(2),
        ..NodeConfig::default()
    }
}
