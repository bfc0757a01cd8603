use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use network::p2p::BlockAnnouncement;
use network::{PeerId, PeerRegistry, WireMessage, short_id};
use parking_lot::Mutex;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::chain::ChainStore;
use crate::downloader::{DownloadError, Downloader, SyncMode, SyncOperation};
use crate::telemetry::SyncTelemetry;

/// Mode the node starts in: snapshot sync only makes sense on an empty chain.
pub fn initial_mode(snapshot_enabled: bool, head_height: u64) -> SyncMode {
    if snapshot_enabled && head_height == 0 {
        SyncMode::SnapshotSync
    } else {
        SyncMode::FullSync
    }
}

/// Sync state shared between the orchestrator and the node API.
pub struct SyncControl {
    snapshot: AtomicBool,
    in_flight: Mutex<Option<CancellationToken>>,
}

impl SyncControl {
    pub fn new(mode: SyncMode) -> Self {
        Self {
            snapshot: AtomicBool::new(mode == SyncMode::SnapshotSync),
            in_flight: Mutex::new(None),
        }
    }

    pub fn mode(&self) -> SyncMode {
        if self.snapshot.load(Ordering::Acquire) {
            SyncMode::SnapshotSync
        } else {
            SyncMode::FullSync
        }
    }

    /// Leaves snapshot sync for good. Returns whether this call made the
    /// switch.
    fn finish_snapshot_sync(&self) -> bool {
        self.snapshot.swap(false, Ordering::AcqRel)
    }

    /// Cancels the attempt in flight, if any.
    pub fn cancel_sync(&self) -> bool {
        match self.in_flight.lock().as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.in_flight.lock().is_some()
    }

    fn begin(&self, token: CancellationToken) {
        *self.in_flight.lock() = Some(token);
    }

    fn end(&self) {
        self.in_flight.lock().take();
    }
}

/// Outcome of one orchestrator cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No peer, or no peer heavier than the local chain.
    Idle,
    Synced { peer: PeerId, imported: bool },
    Failed { peer: PeerId },
}

/// Decides when and from whom to pull chain data.
pub struct SyncOrchestrator {
    registry: Arc<PeerRegistry>,
    chain: Arc<dyn ChainStore>,
    downloader: Arc<dyn Downloader>,
    control: Arc<SyncControl>,
    telemetry: Arc<SyncTelemetry>,
    force_interval: Duration,
    shutdown: CancellationToken,
    /// Peer whose last attempt failed; skipped for exactly one cycle.
    excluded: Option<PeerId>,
}

impl SyncOrchestrator {
    pub fn new(
        registry: Arc<PeerRegistry>,
        chain: Arc<dyn ChainStore>,
        downloader: Arc<dyn Downloader>,
        control: Arc<SyncControl>,
        telemetry: Arc<SyncTelemetry>,
        force_interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            chain,
            downloader,
            control,
            telemetry,
            force_interval,
            shutdown,
            excluded: None,
        }
    }

    /// Runs cycles on every peer-set change and on the force-sync interval
    /// until shutdown.
    pub async fn run(mut self) {
        let mut changes = self.registry.subscribe();
        let mut ticker = interval(self.force_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(mode = %self.control.mode(), "sync orchestrator started");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => trace!("forced sync cycle"),
                Ok(()) = changes.changed() => trace!("peer set changed"),
            }
            self.cycle().await;
        }
        debug!("sync orchestrator stopped");
    }

    pub async fn cycle(&mut self) -> CycleOutcome {
        let excluded: HashSet<PeerId> = self.excluded.take().into_iter().collect();
        let Some(peer) = self.registry.peer_with_highest_weight(&excluded) else {
            return CycleOutcome::Idle;
        };
        let local = self.chain.head();
        let peer_weight = peer.weight();
        if peer_weight <= local.weight {
            trace!(peer = %short_id(peer.id()), "best peer is not ahead of the local chain");
            return CycleOutcome::Idle;
        }

        let peer_id = *peer.id();
        let mode = self.control.mode();
        let cancel = self.shutdown.child_token();
        let op = SyncOperation {
            peer,
            mode,
            cancel: cancel.clone(),
        };
        info!(
            peer = %short_id(&peer_id),
            %mode,
            local_weight = %local.weight,
            peer_weight = %peer_weight,
            "starting sync"
        );

        self.control.begin(cancel.clone());
        self.telemetry.record_attempt();
        let started = Instant::now();
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(DownloadError::Cancelled),
            result = self.downloader.run_sync(op) => result,
        };
        self.control.end();

        match result {
            Ok(imported) => {
                self.telemetry.record_success(imported, started.elapsed());
                if imported {
                    if mode == SyncMode::SnapshotSync && self.control.finish_snapshot_sync() {
                        info!("snapshot sync complete, switching to full sync");
                    }
                    self.announce_head();
                }
                debug!(peer = %short_id(&peer_id), imported, "sync attempt finished");
                CycleOutcome::Synced {
                    peer: peer_id,
                    imported,
                }
            }
            Err(err) => {
                warn!(peer = %short_id(&peer_id), %err, "sync attempt failed");
                self.telemetry
                    .record_failure(hex::encode(peer_id), err.to_string(), started.elapsed());
                self.excluded = Some(peer_id);
                CycleOutcome::Failed { peer: peer_id }
            }
        }
    }

    fn announce_head(&self) {
        let head = self.chain.head();
        let msg = WireMessage::NewBlockHashes(vec![BlockAnnouncement {
            hash: head.hash,
            height: head.height,
        }]);
        let delivered = self.registry.broadcast(&msg);
        debug!(height = head.height, delivered, "announced new head");
    }
}
