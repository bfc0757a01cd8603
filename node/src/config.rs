use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use fork_id::ForkSchedule;
use network::protocol::local_capabilities;
use network::{Capability, SessionConfig};
use serde::{Deserialize, Serialize};

use crate::error::{NodeError, NodeResult};

pub const DEFAULT_P2P_PORT: u16 = 30303;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub network_id: u64,
    pub node_key: [u8; 32],
    /// Listen address for inbound peers; `None` runs without a listener.
    pub p2p_addr: Option<SocketAddr>,
    pub seeds: Vec<String>,
    pub max_peers: Option<usize>,
    /// Start in snapshot sync when the local chain is still at genesis.
    pub snapshot_sync: bool,
    /// Advertise and serve the snapshot protocol.
    pub snap_protocol: bool,
    pub sync_interval: Duration,
    pub pairing_timeout: Duration,
    pub handshake_timeout: Duration,
    pub outbound_buffer: usize,
    pub forks: ForkSchedule,
}

impl NodeConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> NodeResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> NodeResult<()> {
        if self.max_peers == Some(0) {
            return Err(NodeError::Config("max_peers must be positive".into()));
        }
        if self.sync_interval.is_zero() {
            return Err(NodeError::Config("sync_interval must be positive".into()));
        }
        if self.outbound_buffer == 0 {
            return Err(NodeError::Config("outbound_buffer must be positive".into()));
        }
        Ok(())
    }

    pub fn capabilities(&self) -> Vec<Capability> {
        local_capabilities(self.snap_protocol)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            handshake_timeout: self.handshake_timeout,
            pairing_timeout: self.pairing_timeout,
            outbound_buffer: self.outbound_buffer,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        let session = SessionConfig::default();
        Self {
            network_id: 1,
            node_key: [7u8; 32],
            p2p_addr: Some(SocketAddr::from(([0, 0, 0, 0], DEFAULT_P2P_PORT))),
            seeds: vec![],
            max_peers: Some(50),
            snapshot_sync: true,
            snap_protocol: true,
            sync_interval: Duration::from_secs(10),
            pairing_timeout: session.pairing_timeout,
            handshake_timeout: session.handshake_timeout,
            outbound_buffer: session.outbound_buffer,
            forks: ForkSchedule::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(
            file,
            r#"{{"network_id": 5, "seeds": ["10.0.0.1:30303"], "forks": [{{"name": "london", "height": 12}}]}}"#
        )
        .expect("write config");

        let config = NodeConfig::from_json_file(file.path()).expect("load config");
        assert_eq!(config.network_id, 5);
        assert_eq!(config.seeds, vec!["10.0.0.1:30303".to_string()]);
        assert_eq!(config.forks.heights(), vec![12]);
        assert_eq!(config.sync_interval, Duration::from_secs(10));
        assert!(config.snapshot_sync);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let config = NodeConfig {
            max_peers: Some(0),
            ..NodeConfig::default()
        };
        assert!(matches!(config.validate(), Err(NodeError::Config(_))));

        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, "not json").expect("write config");
        assert!(matches!(
            NodeConfig::from_json_file(file.path()),
            Err(NodeError::Json(_))
        ));
    }

    #[test]
    fn capabilities_follow_snap_switch() {
        let config = NodeConfig {
            snap_protocol: false,
            ..NodeConfig::default()
        };
        assert!(
            config
                .capabilities()
                .iter()
                .all(|cap| cap.name != network::protocol::SNAP_PROTOCOL)
        );
    }
}
