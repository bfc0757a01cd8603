use std::sync::Arc;

use fork_id::{ForkIdError, ForkSchedule};
use network::NetworkError;
use network::protocol::CHAIN_PROTOCOL;
use sync_node::config::NodeConfig;
use sync_node::test_utils::{ChainServer, MemoryChain, ScriptedDownloader, test_config};
use sync_node::{NodeHandle, NodeService};
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep, timeout};

type SessionResult = Result<(), NetworkError>;

async fn start_node(config: NodeConfig, blocks: u64) -> NodeHandle {
    let chain = Arc::new(MemoryChain::with_blocks(blocks));
    NodeService::start(
        config,
        chain.clone(),
        Arc::new(ScriptedDownloader::default()),
        Arc::new(ChainServer::new(chain)),
    )
    .await
    .expect("start node")
}

fn chain_only(seed: u8) -> NodeConfig {
    NodeConfig {
        snap_protocol: false,
        ..test_config(seed)
    }
}

fn pipe(
    dialer: &NodeHandle,
    listener: &NodeHandle,
) -> (JoinHandle<SessionResult>, JoinHandle<SessionResult>) {
    let (a, b) = tokio::io::duplex(1 << 16);
    (dialer.connect(a, CHAIN_PROTOCOL), listener.accept(b))
}

async fn finish(handle: JoinHandle<SessionResult>) -> SessionResult {
    timeout(Duration::from_secs(5), handle)
        .await
        .expect("session ended in time")
        .expect("session task panicked")
}

async fn wait_for_peers(node: &NodeHandle, count: usize) {
    timeout(Duration::from_secs(5), async {
        while node.api().peer_count() != count {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("peers registered in time");
}

#[tokio::test]
async fn network_id_mismatch_rejects_both_sides() {
    let a = start_node(chain_only(1), 4).await;
    let b = start_node(
        NodeConfig {
            network_id: 2,
            ..chain_only(2)
        },
        4,
    )
    .await;

    let (dialer, listener) = pipe(&a, &b);
    assert!(matches!(
        finish(dialer).await,
        Err(NetworkError::IncompatibleNetwork { local: 1, remote: 2 })
    ));
    assert!(matches!(
        finish(listener).await,
        Err(NetworkError::IncompatibleNetwork { local: 2, remote: 1 })
    ));
    assert_eq!(a.api().peer_count(), 0);
    assert_eq!(b.api().peer_count(), 0);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn peer_missing_a_passed_upgrade_is_stale() {
    let upgraded = start_node(
        NodeConfig {
            forks: ForkSchedule::from_heights([5]),
            ..chain_only(1)
        },
        10,
    )
    .await;
    let legacy = start_node(chain_only(2), 10).await;

    let (dialer, listener) = pipe(&upgraded, &legacy);
    assert!(matches!(
        finish(dialer).await,
        Err(NetworkError::IncompatibleFork(ForkIdError::RemoteStale))
    ));
    assert!(matches!(
        finish(listener).await,
        Err(NetworkError::IncompatibleFork(
            ForkIdError::LocalIncompatibleOrStale
        ))
    ));
    assert!(upgraded.registry().is_empty());
    assert!(legacy.registry().is_empty());

    upgraded.shutdown().await;
    legacy.shutdown().await;
}

#[tokio::test]
async fn upgrade_ahead_of_both_heads_is_compatible() {
    let a = start_node(
        NodeConfig {
            forks: ForkSchedule::from_heights([100]),
            ..chain_only(1)
        },
        10,
    )
    .await;
    let b = start_node(chain_only(2), 10).await;

    let _sessions = pipe(&a, &b);
    wait_for_peers(&a, 1).await;
    wait_for_peers(&b, 1).await;
    assert_eq!(a.registry().satellite_count(), 0);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn second_session_from_same_peer_is_refused() {
    let a = start_node(chain_only(1), 2).await;
    let b = start_node(chain_only(2), 2).await;

    let _first = pipe(&a, &b);
    wait_for_peers(&b, 1).await;

    let (dialer, listener) = pipe(&a, &b);
    assert!(matches!(
        finish(listener).await,
        Err(NetworkError::DuplicateIdentity(_))
    ));
    assert!(finish(dialer).await.is_err());
    assert!(b.registry().contains(&a.peer_id()));
    assert_eq!(b.api().peer_count(), 1);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn peer_limit_refuses_extra_sessions() {
    let hub = start_node(
        NodeConfig {
            max_peers: Some(1),
            ..chain_only(1)
        },
        0,
    )
    .await;
    let first = start_node(chain_only(2), 3).await;
    let second = start_node(chain_only(3), 3).await;

    let _kept = pipe(&first, &hub);
    wait_for_peers(&hub, 1).await;

    let (_dialer, listener) = pipe(&second, &hub);
    assert!(matches!(
        finish(listener).await,
        Err(NetworkError::TooManyPeers(1))
    ));
    assert!(hub.registry().contains(&first.peer_id()));
    assert!(!hub.registry().contains(&second.peer_id()));

    hub.shutdown().await;
    first.shutdown().await;
    second.shutdown().await;
}

#[tokio::test]
async fn shutdown_unregisters_remote_peer() {
    let a = start_node(chain_only(1), 2).await;
    let b = start_node(chain_only(2), 2).await;

    let (dialer, _listener) = pipe(&a, &b);
    wait_for_peers(&b, 1).await;

    a.shutdown().await;
    assert!(finish(dialer).await.is_ok());
    wait_for_peers(&b, 0).await;

    b.shutdown().await;
}
