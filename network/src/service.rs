use crate::p2p::{Connection, Hello};
use crate::protocol::{CHAIN_PROTOCOL, ProtocolType, SNAP_PROTOCOL, negotiate, protocol_type, supports};
use crate::session::{SessionContext, run_primary, run_satellite};
use crate::{NetworkError, peer_id_from_key, short_id};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

const RECONNECT_BASE: Duration = Duration::from_secs(2);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct P2PConfig {
    pub listen_addr: SocketAddr,
    pub seeds: Vec<String>,
    pub node_key: [u8; 32],
}

/// Exchanges hellos on a fresh connection and runs the session for the
/// sub-protocol it carries.
///
/// `dial` is the sub-protocol to open when the local side initiated the
/// connection; the accepting side passes `None` and follows the dialer.
pub async fn serve_connection<T>(
    ctx: &SessionContext,
    io: T,
    node_key: [u8; 32],
    dial: Option<&str>,
) -> Result<(), NetworkError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut conn = Connection::new(io);
    let remote = timeout(
        ctx.config.handshake_timeout,
        exchange_hello(&mut conn, ctx, node_key, dial),
    )
    .await
    .map_err(|_| NetworkError::HandshakeTimeout)??;

    if remote.node_key == node_key {
        return Err(NetworkError::Disconnected("connected to self".into()));
    }
    let id = peer_id_from_key(&remote.node_key);
    let cap = negotiate(&ctx.capabilities, &remote.capabilities, &remote.stream)
        .ok_or_else(|| NetworkError::UnsupportedProtocol(remote.stream.clone()))?;
    debug!(peer = %short_id(&id), %cap, "hello exchanged");

    match protocol_type(&cap.name) {
        ProtocolType::Chain => run_primary(ctx, conn, id, cap.version, remote.capabilities).await,
        ProtocolType::Snapshot => run_satellite(ctx, conn, id, cap.version).await,
        ProtocolType::Unknown => Err(NetworkError::UnsupportedProtocol(cap.name)),
    }
}

async fn exchange_hello<T>(
    conn: &mut Connection<T>,
    ctx: &SessionContext,
    node_key: [u8; 32],
    dial: Option<&str>,
) -> Result<Hello, NetworkError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let hello = |stream: &str| Hello {
        node_key,
        capabilities: ctx.capabilities.clone(),
        stream: stream.to_string(),
    };
    match dial {
        Some(stream) => {
            conn.send(&hello(stream)).await?;
            let remote: Hello = conn.expect().await?;
            if remote.stream != stream {
                return Err(NetworkError::UnexpectedMessage("hello for another stream"));
            }
            Ok(remote)
        }
        None => {
            let remote: Hello = conn.expect().await?;
            conn.send(&hello(&remote.stream)).await?;
            Ok(remote)
        }
    }
}

/// TCP front end: accepts inbound connections and keeps seed connections
/// alive.
pub struct P2PService {
    config: P2PConfig,
    ctx: SessionContext,
    tasks: TaskTracker,
}

impl P2PService {
    pub fn new(config: P2PConfig, ctx: SessionContext, tasks: TaskTracker) -> Self {
        Self { config, ctx, tasks }
    }

    /// Binds the listener, dials the seeds and returns the bound address.
    /// All work runs on the task tracker until the shutdown token fires.
    pub async fn start(self) -> Result<SocketAddr, NetworkError> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("p2p service listening on {}", local_addr);

        for seed in &self.config.seeds {
            match seed.parse::<SocketAddr>() {
                Ok(addr) => {
                    self.spawn_dial(addr, CHAIN_PROTOCOL);
                    if supports(&self.ctx.capabilities, SNAP_PROTOCOL) {
                        self.spawn_dial(addr, SNAP_PROTOCOL);
                    }
                }
                Err(e) => warn!(%seed, "ignoring malformed seed address: {}", e),
            }
        }

        let ctx = self.ctx.clone();
        let tasks = self.tasks.clone();
        let node_key = self.config.node_key;
        self.tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = ctx.shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((socket, addr)) => {
                            debug!("incoming connection from {}", addr);
                            let ctx = ctx.clone();
                            tasks.spawn(async move {
                                if let Err(e) = serve_connection(&ctx, socket, node_key, None).await {
                                    warn!("session with {} failed: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => warn!("accept failed: {}", e),
                    },
                }
            }
            debug!("p2p listener stopped");
        });

        Ok(local_addr)
    }

    fn spawn_dial(&self, addr: SocketAddr, stream: &'static str) {
        let ctx = self.ctx.clone();
        let node_key = self.config.node_key;
        self.tasks.spawn(async move {
            let mut backoff = RECONNECT_BASE;
            loop {
                tokio::select! {
                    _ = ctx.shutdown.cancelled() => break,
                    result = dial_once(&ctx, addr, node_key, stream) => match result {
                        Ok(()) => {
                            debug!(%stream, "session with seed {} closed", addr);
                            backoff = RECONNECT_BASE;
                        }
                        Err(e) => warn!(%stream, "session with seed {} failed: {}", addr, e),
                    },
                }
                tokio::select! {
                    _ = ctx.shutdown.cancelled() => break,
                    _ = sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(RECONNECT_MAX);
            }
        });
    }
}

async fn dial_once(
    ctx: &SessionContext,
    addr: SocketAddr,
    node_key: [u8; 32],
    stream: &str,
) -> Result<(), NetworkError> {
    let socket = TcpStream::connect(addr).await?;
    serve_connection(ctx, socket, node_key, Some(stream)).await
}
