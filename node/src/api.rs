//! Read-only view of the node for RPC and monitoring collaborators.

use std::sync::Arc;

use fork_id::ForkEntry;
use network::{LocalRecord, PeerInfo, PeerRegistry, SatelliteInfo};
use serde::Serialize;

use crate::downloader::SyncMode;
use crate::error::NodeResult;
use crate::sync::SyncControl;
use crate::telemetry::{SyncTelemetry, SyncTelemetrySnapshot};

#[derive(Clone, Debug, Serialize)]
pub struct PeerSummary {
    pub id: String,
    pub chain: PeerInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snap: Option<SatelliteInfo>,
}

#[derive(Clone, Debug, Serialize)]
pub struct NodeStatus {
    pub peer_count: usize,
    pub sync_mode: SyncMode,
    pub syncing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fork_id: Option<String>,
    pub telemetry: SyncTelemetrySnapshot,
}

#[derive(Clone)]
pub struct NodeApi {
    registry: Arc<PeerRegistry>,
    control: Arc<SyncControl>,
    record: Arc<LocalRecord>,
    telemetry: Arc<SyncTelemetry>,
}

impl NodeApi {
    pub fn new(
        registry: Arc<PeerRegistry>,
        control: Arc<SyncControl>,
        record: Arc<LocalRecord>,
        telemetry: Arc<SyncTelemetry>,
    ) -> Self {
        Self {
            registry,
            control,
            record,
            telemetry,
        }
    }

    pub fn peer_count(&self) -> usize {
        self.registry.len()
    }

    pub fn peers(&self) -> Vec<PeerSummary> {
        self.registry
            .snapshot()
            .iter()
            .map(|peer| PeerSummary {
                id: hex::encode(peer.id()),
                chain: peer.info(),
                snap: peer.satellite().map(|satellite| satellite.info()),
            })
            .collect()
    }

    pub fn sync_mode(&self) -> SyncMode {
        self.control.mode()
    }

    /// Cancels the sync attempt in flight. Returns `false` when idle.
    pub fn cancel_sync(&self) -> bool {
        self.control.cancel_sync()
    }

    pub fn fork_entry(&self) -> NodeResult<Option<ForkEntry>> {
        Ok(self.record.fork_entry()?)
    }

    pub fn telemetry(&self) -> SyncTelemetrySnapshot {
        self.telemetry.snapshot()
    }

    pub fn status(&self) -> NodeResult<NodeStatus> {
        Ok(NodeStatus {
            peer_count: self.peer_count(),
            sync_mode: self.sync_mode(),
            syncing: self.control.is_syncing(),
            fork_id: self.fork_entry()?.map(|entry| entry.fork_id.to_string()),
            telemetry: self.telemetry(),
        })
    }
}
