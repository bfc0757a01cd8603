//! Chain protocol status handshake.
//!
//! Immediately after the transport hello, both ends of a chain connection
//! send one `Status` and validate the one they receive. Nothing else may be
//! exchanged until both checks pass.

use crate::p2p::{Connection, WireMessage};
use crate::{BlockHash, ChainWeight, NetworkError};
use fork_id::{ForkId, ForkIdError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tracing::debug;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub protocol_version: u32,
    pub network_id: u64,
    pub total_weight: ChainWeight,
    pub head_hash: BlockHash,
    pub genesis_hash: BlockHash,
    pub fork_id: ForkId,
}

/// Local chain view used to build and check status messages.
pub trait StatusSource: Send + Sync {
    /// Status describing the local chain at the negotiated version.
    fn local_status(&self, protocol_version: u32) -> StatusMessage;

    /// Checks a remote fork id against the local fork schedule and head.
    fn validate_fork(&self, remote: ForkId) -> Result<(), ForkIdError>;
}

/// Validates a received status against the local one.
pub fn check_status(
    local: &StatusMessage,
    remote: &StatusMessage,
    source: &dyn StatusSource,
) -> Result<(), NetworkError> {
    if remote.network_id != local.network_id {
        return Err(NetworkError::IncompatibleNetwork {
            local: local.network_id,
            remote: remote.network_id,
        });
    }
    if remote.protocol_version != local.protocol_version {
        return Err(NetworkError::ProtocolVersionMismatch {
            local: local.protocol_version,
            remote: remote.protocol_version,
        });
    }
    if remote.genesis_hash != local.genesis_hash {
        return Err(NetworkError::GenesisMismatch {
            local: local.genesis_hash,
            remote: remote.genesis_hash,
        });
    }
    source.validate_fork(remote.fork_id)?;
    Ok(())
}

/// Sends the local status, waits for the remote one and validates it.
///
/// The whole exchange is bounded by `limit`.
pub async fn exchange_status<T>(
    conn: &mut Connection<T>,
    source: &dyn StatusSource,
    protocol_version: u32,
    limit: Duration,
) -> Result<StatusMessage, NetworkError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let local = source.local_status(protocol_version);
    let remote = timeout(limit, send_and_receive(conn, &local))
        .await
        .map_err(|_| NetworkError::HandshakeTimeout)??;

    check_status(&local, &remote, source)?;
    debug!(
        version = remote.protocol_version,
        weight = %remote.total_weight,
        fork_id = %remote.fork_id,
        "status handshake complete"
    );
    Ok(remote)
}

async fn send_and_receive<T>(
    conn: &mut Connection<T>,
    local: &StatusMessage,
) -> Result<StatusMessage, NetworkError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    conn.send(&WireMessage::Status(local.clone())).await?;
    match conn.expect::<WireMessage>().await? {
        WireMessage::Status(remote) => Ok(remote),
        WireMessage::Disconnect(reason) => Err(NetworkError::Disconnected(reason)),
        _ => Err(NetworkError::UnexpectedMessage("expected status")),
    }
}
