use std::net::SocketAddr;
use std::sync::Arc;

use network::service::serve_connection;
use network::{
    LocalRecord, MessageHandler, NetworkError, P2PConfig, P2PService, PeerId, PeerRegistry,
    SatelliteRendezvous, SessionContext, peer_id_from_key, short_id,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::advertiser::ForkAdvertiser;
use crate::api::NodeApi;
use crate::chain::{ChainStatus, ChainStore};
use crate::config::NodeConfig;
use crate::downloader::Downloader;
use crate::error::NodeResult;
use crate::sync::{SyncControl, SyncOrchestrator, initial_mode};
use crate::telemetry::SyncTelemetry;

/// Running node. Dropping the handle does not stop the node; call
/// [`NodeHandle::shutdown`].
pub struct NodeHandle {
    api: NodeApi,
    ctx: SessionContext,
    node_key: [u8; 32],
    local_addr: Option<SocketAddr>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl NodeHandle {
    pub fn api(&self) -> &NodeApi {
        &self.api
    }

    pub fn peer_id(&self) -> PeerId {
        peer_id_from_key(&self.node_key)
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.ctx.registry
    }

    /// Address of the p2p listener, if one was configured.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Runs the dialing side of a session for `stream` over an established
    /// byte stream.
    pub fn connect<T>(&self, io: T, stream: &'static str) -> JoinHandle<Result<(), NetworkError>>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.spawn_session(io, Some(stream))
    }

    /// Runs the accepting side of a session over an established byte stream.
    pub fn accept<T>(&self, io: T) -> JoinHandle<Result<(), NetworkError>>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.spawn_session(io, None)
    }

    fn spawn_session<T>(&self, io: T, dial: Option<&'static str>) -> JoinHandle<Result<(), NetworkError>>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let ctx = self.ctx.clone();
        let node_key = self.node_key;
        self.tasks.spawn(async move {
            let result = serve_connection(&ctx, io, node_key, dial).await;
            if let Err(err) = &result {
                warn!(%err, "session ended with error");
            }
            result
        })
    }

    /// Stops every task and waits for them to finish.
    pub async fn shutdown(self) {
        info!(node = %short_id(&self.peer_id()), "shutting down node");
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        info!("node stopped");
    }
}

pub struct NodeService;

impl NodeService {
    /// Wires up sessions, the sync orchestrator and the fork advertiser and
    /// starts the p2p listener when configured.
    pub async fn start(
        config: NodeConfig,
        chain: Arc<dyn ChainStore>,
        downloader: Arc<dyn Downloader>,
        handler: Arc<dyn MessageHandler>,
    ) -> NodeResult<NodeHandle> {
        config.validate()?;
        let shutdown = CancellationToken::new();
        let tasks = TaskTracker::new();

        let registry = Arc::new(PeerRegistry::new(config.max_peers));
        let ctx = SessionContext {
            registry: registry.clone(),
            rendezvous: Arc::new(SatelliteRendezvous::new()),
            handler,
            status: Arc::new(ChainStatus::new(
                config.network_id,
                config.forks.clone(),
                chain.clone(),
            )),
            capabilities: config.capabilities(),
            config: config.session_config(),
            shutdown: shutdown.clone(),
        };

        let record = Arc::new(LocalRecord::new());
        let advertiser = ForkAdvertiser::new(
            chain.clone(),
            record.clone(),
            config.forks.clone(),
            shutdown.clone(),
        );
        advertiser.publish();
        tasks.spawn(advertiser.run());

        let head = chain.head();
        let control = Arc::new(SyncControl::new(initial_mode(
            config.snapshot_sync,
            head.height,
        )));
        let telemetry = Arc::new(SyncTelemetry::new());
        let orchestrator = SyncOrchestrator::new(
            registry.clone(),
            chain,
            downloader,
            control.clone(),
            telemetry.clone(),
            config.sync_interval,
            shutdown.clone(),
        );
        tasks.spawn(orchestrator.run());

        let local_addr = match config.p2p_addr {
            Some(listen_addr) => {
                let p2p = P2PService::new(
                    P2PConfig {
                        listen_addr,
                        seeds: config.seeds.clone(),
                        node_key: config.node_key,
                    },
                    ctx.clone(),
                    tasks.clone(),
                );
                match p2p.start().await {
                    Ok(addr) => Some(addr),
                    Err(err) => {
                        shutdown.cancel();
                        tasks.close();
                        tasks.wait().await;
                        return Err(err.into());
                    }
                }
            }
            None => None,
        };

        info!(
            node = %short_id(&peer_id_from_key(&config.node_key)),
            network_id = config.network_id,
            height = head.height,
            mode = %control.mode(),
            "node started"
        );

        Ok(NodeHandle {
            api: NodeApi::new(registry, control, record, telemetry),
            ctx,
            node_key: config.node_key,
            local_addr,
            shutdown,
            tasks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::SyncMode;
    use crate::test_utils::{MemoryChain, ScriptedDownloader, test_config};

    #[tokio::test]
    async fn start_seeds_mode_and_publishes_fork_entry() {
        let empty = Arc::new(MemoryChain::new());
        let node = NodeService::start(
            test_config(1),
            empty.clone(),
            Arc::new(ScriptedDownloader::default()),
            Arc::new(crate::test_utils::ChainServer::new(empty)),
        )
        .await
        .expect("start empty node");
        assert_eq!(node.api().sync_mode(), SyncMode::SnapshotSync);
        assert!(node.api().fork_entry().expect("decode").is_some());
        assert_eq!(node.api().peer_count(), 0);
        node.shutdown().await;

        let synced = Arc::new(MemoryChain::with_blocks(3));
        let node = NodeService::start(
            test_config(2),
            synced.clone(),
            Arc::new(ScriptedDownloader::default()),
            Arc::new(crate::test_utils::ChainServer::new(synced)),
        )
        .await
        .expect("start synced node");
        assert_eq!(node.api().sync_mode(), SyncMode::FullSync);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let chain = Arc::new(MemoryChain::new());
        let config = NodeConfig {
            outbound_buffer: 0,
            ..test_config(1)
        };
        let result = NodeService::start(
            config,
            chain.clone(),
            Arc::new(ScriptedDownloader::default()),
            Arc::new(crate::test_utils::ChainServer::new(chain)),
        )
        .await;
        assert!(matches!(result, Err(crate::error::NodeError::Config(_))));
    }
}
