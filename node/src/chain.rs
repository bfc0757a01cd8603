use std::sync::Arc;

use fork_id::{ForkFilter, ForkId, ForkIdError, ForkSchedule};
use network::{BlockHash, ChainWeight, StatusMessage, StatusSource};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainHead {
    pub hash: BlockHash,
    pub height: u64,
    pub weight: ChainWeight,
}

/// Published by the chain store whenever its canonical head moves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeadEvent {
    pub hash: BlockHash,
    pub height: u64,
}

/// Read access to the local canonical chain.
pub trait ChainStore: Send + Sync {
    fn genesis_hash(&self) -> BlockHash;

    fn head(&self) -> ChainHead;

    fn canonical_hash(&self, height: u64) -> Option<BlockHash>;

    /// Head-change notifications. The receiver reports `Closed` once the
    /// store stops publishing.
    fn subscribe_head(&self) -> broadcast::Receiver<HeadEvent>;
}

/// Builds and checks status messages from the live chain store.
pub struct ChainStatus {
    network_id: u64,
    schedule: ForkSchedule,
    genesis: BlockHash,
    filter: ForkFilter,
    chain: Arc<dyn ChainStore>,
}

impl ChainStatus {
    pub fn new(network_id: u64, schedule: ForkSchedule, chain: Arc<dyn ChainStore>) -> Self {
        let genesis = chain.genesis_hash();
        let filter = ForkFilter::new(&schedule, &genesis);
        Self {
            network_id,
            schedule,
            genesis,
            filter,
            chain,
        }
    }
}

impl StatusSource for ChainStatus {
    fn local_status(&self, protocol_version: u32) -> StatusMessage {
        let head = self.chain.head();
        StatusMessage {
            protocol_version,
            network_id: self.network_id,
            total_weight: head.weight,
            head_hash: head.hash,
            genesis_hash: self.genesis,
            fork_id: ForkId::new(&self.schedule, &self.genesis, head.height),
        }
    }

    fn validate_fork(&self, remote: ForkId) -> Result<(), ForkIdError> {
        self.filter.validate(remote, self.chain.head().height)
    }
}
