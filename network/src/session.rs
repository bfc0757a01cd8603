//! Per-connection protocol sessions.
//!
//! A chain connection runs the status handshake, waits for its snapshot
//! satellite when both sides speak snap, registers the resulting [`Peer`]
//! and then pumps messages until either side goes away. A snap connection
//! offers itself to the rendezvous and pumps snapshot messages for as long
//! as its primary lives.

use crate::handshake::{StatusSource, exchange_status};
use crate::p2p::{Connection, SatelliteMessage, WireMessage};
use crate::peer::{Peer, PeerHead, SatellitePeer};
use crate::protocol::{Capability, SNAP_PROTOCOL, supports};
use crate::registry::PeerRegistry;
use crate::rendezvous::SatelliteRendezvous;
use crate::{NetworkError, PeerId, short_id};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Consumer of inbound protocol messages.
///
/// Returning an error ends the session that delivered the message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(&self, peer: &Arc<Peer>, msg: WireMessage) -> Result<(), NetworkError>;

    async fn handle_satellite(
        &self,
        peer_id: &PeerId,
        satellite: &SatellitePeer,
        msg: SatelliteMessage,
    ) -> Result<(), NetworkError>;
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub handshake_timeout: Duration,
    pub pairing_timeout: Duration,
    /// Capacity of each peer's outbound queue.
    pub outbound_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            pairing_timeout: Duration::from_secs(5),
            outbound_buffer: 256,
        }
    }
}

/// Shared state every session runs against.
#[derive(Clone)]
pub struct SessionContext {
    pub registry: Arc<PeerRegistry>,
    pub rendezvous: Arc<SatelliteRendezvous>,
    pub handler: Arc<dyn MessageHandler>,
    pub status: Arc<dyn StatusSource>,
    /// Capabilities the local node advertises.
    pub capabilities: Vec<Capability>,
    pub config: SessionConfig,
    pub shutdown: CancellationToken,
}

impl SessionContext {
    fn snap_enabled(&self) -> bool {
        supports(&self.capabilities, SNAP_PROTOCOL)
    }
}

/// Removes the peer from the registry and closes its satellite when the
/// session ends, however it ends.
struct Registration {
    registry: Arc<PeerRegistry>,
    id: PeerId,
    satellite: Option<SatellitePeer>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(&self.id);
        if let Some(satellite) = &self.satellite {
            satellite.close();
        }
    }
}

/// Runs a chain protocol session to completion.
///
/// Returns `Ok(())` when the remote closes or disconnects cleanly, or on
/// shutdown.
pub async fn run_primary<T>(
    ctx: &SessionContext,
    mut conn: Connection<T>,
    id: PeerId,
    version: u32,
    capabilities: Vec<Capability>,
) -> Result<(), NetworkError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let status = exchange_status(
        &mut conn,
        ctx.status.as_ref(),
        version,
        ctx.config.handshake_timeout,
    )
    .await?;

    let mut slot = if ctx.snap_enabled() && supports(&capabilities, SNAP_PROTOCOL) {
        Some(ctx.rendezvous.claim(id)?)
    } else {
        None
    };
    let satellite = match slot.as_mut() {
        Some(slot) => tokio::select! {
            _ = ctx.shutdown.cancelled() => return Ok(()),
            satellite = slot.wait(ctx.config.pairing_timeout) => satellite,
        },
        None => None,
    };

    if satellite.as_ref().is_some_and(SatellitePeer::is_closed) {
        return Err(NetworkError::Disconnected("snap connection closed".into()));
    }

    let (tx, mut rx) = mpsc::channel(ctx.config.outbound_buffer);
    let peer = Arc::new(Peer::new(
        id,
        version,
        capabilities,
        status.fork_id,
        PeerHead {
            hash: status.head_hash,
            weight: status.total_weight,
        },
        tx,
        satellite.clone(),
    ));
    if let Err(err) = ctx.registry.register(peer.clone()) {
        if let Some(satellite) = &satellite {
            satellite.close();
        }
        return Err(err);
    }
    let paired = satellite.clone();
    let _registration = Registration {
        registry: ctx.registry.clone(),
        id,
        satellite,
    };
    info!(
        peer = %short_id(&id),
        version,
        weight = %peer.weight(),
        snap = peer.satellite().is_some(),
        "peer connected"
    );

    // The logical peer goes away with its snap connection.
    let satellite_gone = async {
        match &paired {
            Some(satellite) => satellite.closed().await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(satellite_gone);

    let result = loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => {
                let _ = conn.send(&WireMessage::Disconnect("shutting down".into())).await;
                break Ok(());
            }
            _ = &mut satellite_gone => {
                if ctx.shutdown.is_cancelled() {
                    let _ = conn.send(&WireMessage::Disconnect("shutting down".into())).await;
                    break Ok(());
                }
                let _ = conn.send(&WireMessage::Disconnect("snap connection closed".into())).await;
                break Err(NetworkError::Disconnected("snap connection closed".into()));
            }
            Some(msg) = rx.recv() => {
                if let Err(err) = conn.send(&msg).await {
                    break Err(err);
                }
            }
            inbound = conn.recv::<WireMessage>() => {
                match inbound {
                    Ok(None) => break Ok(()),
                    Ok(Some(WireMessage::Disconnect(reason))) => {
                        debug!(peer = %short_id(&id), %reason, "peer sent disconnect");
                        break Ok(());
                    }
                    Ok(Some(WireMessage::Status(_))) => {
                        break Err(NetworkError::UnexpectedMessage("status after handshake"));
                    }
                    Ok(Some(msg)) => {
                        let handled = ctx.handler.handle_message(&peer, msg);
                        let drained = drain_while(&mut conn, &mut rx, &ctx.shutdown, handled).await;
                        if let Err(err) = drained {
                            break Err(err);
                        }
                    }
                    Err(err) => break Err(err),
                }
            }
        }
    };

    match &result {
        Ok(()) => info!(peer = %short_id(&id), "peer disconnected"),
        Err(err) => info!(peer = %short_id(&id), %err, "peer dropped"),
    }
    result
}

/// Runs a snapshot protocol session to completion.
///
/// Fails with `PairingRejected` if the identity's primary is not accepting a
/// satellite.
pub async fn run_satellite<T>(
    ctx: &SessionContext,
    mut conn: Connection<T>,
    id: PeerId,
    version: u32,
) -> Result<(), NetworkError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let (tx, mut rx) = mpsc::channel(ctx.config.outbound_buffer);
    let close = ctx.shutdown.child_token();
    let satellite = SatellitePeer::new(id, version, tx, close.clone());
    // Ending this session, however it ends, tells the primary.
    let _closed_on_exit = close.clone().drop_guard();
    let _offer = ctx.rendezvous.offer(satellite.clone())?;
    debug!(peer = %short_id(&id), version, "satellite session open");

    loop {
        tokio::select! {
            _ = close.cancelled() => return Ok(()),
            Some(msg) = rx.recv() => conn.send(&msg).await?,
            inbound = conn.recv::<SatelliteMessage>() => match inbound? {
                None => return Ok(()),
                Some(msg) => {
                    let handled = ctx.handler.handle_satellite(&id, &satellite, msg);
                    drain_while(&mut conn, &mut rx, &close, handled).await?;
                }
            },
        }
    }
}

/// Drives a handler future while still flushing the outbound queue, so a
/// handler that replies through its own peer never waits on this session.
async fn drain_while<T, M, F>(
    conn: &mut Connection<T>,
    rx: &mut mpsc::Receiver<M>,
    stop: &CancellationToken,
    handled: F,
) -> Result<(), NetworkError>
where
    T: AsyncRead + AsyncWrite + Unpin,
    M: Serialize,
    F: Future<Output = Result<(), NetworkError>>,
{
    tokio::pin!(handled);
    loop {
        tokio::select! {
            result = &mut handled => return result,
            _ = stop.cancelled() => return Ok(()),
            Some(msg) = rx.recv() => conn.send(&msg).await?,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::handshake::StatusMessage;
    use crate::protocol::local_capabilities;
    use crate::ChainWeight;
    use fork_id::{ForkFilter, ForkId, ForkIdError, ForkSchedule};
    use parking_lot::Mutex;

    pub struct StaticChain {
        pub weight: u64,
    }

    impl StatusSource for StaticChain {
        fn local_status(&self, protocol_version: u32) -> StatusMessage {
            StatusMessage {
                protocol_version,
                network_id: 1,
                total_weight: ChainWeight::from(self.weight),
                head_hash: [0xaa; 32],
                genesis_hash: [0x01; 32],
                fork_id: ForkId::new(&ForkSchedule::default(), &[0x01; 32], 0),
            }
        }

        fn validate_fork(&self, remote: ForkId) -> Result<(), ForkIdError> {
            ForkFilter::new(&ForkSchedule::default(), &[0x01; 32]).validate(remote, 0)
        }
    }

    /// Records every message and fails on transactions with no payload.
    #[derive(Default)]
    pub struct Recorder {
        pub chain: Mutex<Vec<&'static str>>,
        pub snap: Mutex<Vec<SatelliteMessage>>,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle_message(
            &self,
            _peer: &Arc<Peer>,
            msg: WireMessage,
        ) -> Result<(), NetworkError> {
            self.chain.lock().push(msg.kind());
            match msg {
                WireMessage::Transactions(txs) if txs.is_empty() => {
                    Err(NetworkError::Handler("empty transaction batch".into()))
                }
                _ => Ok(()),
            }
        }

        async fn handle_satellite(
            &self,
            _peer_id: &PeerId,
            _satellite: &SatellitePeer,
            msg: SatelliteMessage,
        ) -> Result<(), NetworkError> {
            self.snap.lock().push(msg);
            Ok(())
        }
    }

    pub fn context(weight: u64, snap: bool, handler: Arc<Recorder>) -> SessionContext {
        SessionContext {
            registry: Arc::new(PeerRegistry::default()),
            rendezvous: Arc::new(SatelliteRendezvous::new()),
            handler,
            status: Arc::new(StaticChain { weight }),
            capabilities: local_capabilities(snap),
            config: SessionConfig {
                handshake_timeout: Duration::from_secs(2),
                pairing_timeout: Duration::from_millis(200),
                outbound_buffer: 16,
            },
            shutdown: CancellationToken::new(),
        }
    }
}
