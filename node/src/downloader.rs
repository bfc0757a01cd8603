use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use network::{NetworkError, Peer};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    SnapshotSync,
    FullSync,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::SnapshotSync => f.write_str("snapshot"),
            SyncMode::FullSync => f.write_str("full"),
        }
    }
}

/// One sync attempt against one peer.
pub struct SyncOperation {
    pub peer: Arc<Peer>,
    pub mode: SyncMode,
    /// Fires when the attempt is cancelled; the downloader should stop
    /// promptly and return `DownloadError::Cancelled`.
    pub cancel: CancellationToken,
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("sync cancelled")]
    Cancelled,
    #[error("peer failure: {0}")]
    Peer(String),
    #[error("invalid chain data: {0}")]
    Invalid(String),
    #[error("network error: {0}")]
    Network(#[from] NetworkError),
}

/// Engine that pulls chain data from a peer.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Runs one attempt. `Ok(true)` means at least one block was imported.
    async fn run_sync(&self, op: SyncOperation) -> Result<bool, DownloadError>;
}
