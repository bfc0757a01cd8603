use std::sync::Arc;

use fork_id::{ForkEntry, ForkId, ForkSchedule};
use network::LocalRecord;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chain::ChainStore;

/// Keeps the fork entry of the local discovery record in step with the
/// chain head.
pub struct ForkAdvertiser {
    chain: Arc<dyn ChainStore>,
    record: Arc<LocalRecord>,
    schedule: ForkSchedule,
    shutdown: CancellationToken,
}

impl ForkAdvertiser {
    pub fn new(
        chain: Arc<dyn ChainStore>,
        record: Arc<LocalRecord>,
        schedule: ForkSchedule,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            chain,
            record,
            schedule,
            shutdown,
        }
    }

    pub fn current_entry(&self) -> ForkEntry {
        let head = self.chain.head();
        ForkEntry::new(ForkId::new(
            &self.schedule,
            &self.chain.genesis_hash(),
            head.height,
        ))
    }

    /// Writes the entry for the current head. Returns whether the record
    /// changed.
    pub fn publish(&self) -> bool {
        let entry = self.current_entry();
        match self.record.set_fork_entry(&entry) {
            Ok(true) => {
                info!(fork_id = %entry.fork_id, "fork entry updated");
                true
            }
            Ok(false) => false,
            Err(err) => {
                warn!(%err, "failed to encode fork entry");
                false
            }
        }
    }

    /// Republishes on every head change until the chain stops publishing or
    /// the node shuts down.
    pub async fn run(self) {
        let mut heads = self.chain.subscribe_head();
        self.publish();
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = heads.recv() => match event {
                    Ok(_) => {
                        self.publish();
                    }
                    Err(RecvError::Lagged(missed)) => {
                        debug!(missed, "head notifications lagged");
                        self.publish();
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!("fork advertiser stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MemoryChain;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    async fn wait_for(mut check: impl FnMut() -> bool) {
        timeout(Duration::from_secs(2), async {
            while !check() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition reached in time");
    }

    #[tokio::test]
    async fn entry_follows_head_and_stops_when_chain_closes() {
        let chain = Arc::new(MemoryChain::new());
        let record = Arc::new(LocalRecord::new());
        let schedule = ForkSchedule::from_heights([2, 4]);
        let advertiser = ForkAdvertiser::new(
            chain.clone(),
            record.clone(),
            schedule,
            CancellationToken::new(),
        );
        let task = tokio::spawn(advertiser.run());

        let entry_next = || {
            record
                .fork_entry()
                .expect("decodable entry")
                .map(|entry| entry.fork_id.next)
        };
        wait_for(|| entry_next() == Some(2)).await;

        let source = MemoryChain::with_blocks(5);
        chain.import(source.blocks_from(1, 1)).expect("import 1");
        chain.import(source.blocks_from(2, 1)).expect("import 2");
        wait_for(|| entry_next() == Some(4)).await;

        chain.import(source.blocks_from(3, 3)).expect("import 3..5");
        wait_for(|| entry_next() == Some(0)).await;

        chain.close();
        timeout(Duration::from_secs(2), task)
            .await
            .expect("advertiser exited")
            .expect("join");
    }

    #[tokio::test]
    async fn publish_is_idempotent_between_upgrades() {
        let chain = Arc::new(MemoryChain::new());
        let record = Arc::new(LocalRecord::new());
        let advertiser = ForkAdvertiser::new(
            chain.clone(),
            record.clone(),
            ForkSchedule::from_heights([10]),
            CancellationToken::new(),
        );
        assert!(advertiser.publish());
        let seq = record.seq();

        let source = MemoryChain::with_blocks(3);
        chain.import(source.blocks_from(1, 3)).expect("import");
        assert!(!advertiser.publish());
        assert_eq!(record.seq(), seq);
    }

    #[tokio::test]
    async fn shutdown_stops_the_advertiser() {
        let shutdown = CancellationToken::new();
        let advertiser = ForkAdvertiser::new(
            Arc::new(MemoryChain::new()),
            Arc::new(LocalRecord::new()),
            ForkSchedule::default(),
            shutdown.clone(),
        );
        let task = tokio::spawn(advertiser.run());
        shutdown.cancel();
        timeout(Duration::from_secs(2), task)
            .await
            .expect("advertiser exited")
            .expect("join");
    }
}
