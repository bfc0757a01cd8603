//! Sub-protocol capabilities and version negotiation.
//!
//! Every connection carries exactly one sub-protocol:
//!
//! ```text
//! chain/N  - block propagation and chain sync (primary, carries the status handshake)
//! snap/N   - state snapshot transfer (satellite, paired with a chain connection)
//! ```
//!
//! A node advertises its full capability list in the transport hello, so the
//! primary session knows whether to wait for a satellite connection.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Block propagation protocol name
pub const CHAIN_PROTOCOL: &str = "chain";

/// State snapshot protocol name
pub const SNAP_PROTOCOL: &str = "snap";

/// Supported chain protocol versions, newest first
pub const CHAIN_VERSIONS: &[u32] = &[67, 66];

/// Supported snapshot protocol versions, newest first
pub const SNAP_VERSIONS: &[u32] = &[1];

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    pub version: u32,
}

impl Capability {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }

    pub fn chain(version: u32) -> Self {
        Self::new(CHAIN_PROTOCOL, version)
    }

    pub fn snap(version: u32) -> Self {
        Self::new(SNAP_PROTOCOL, version)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}

/// Protocol type for categorization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolType {
    /// Primary block sync protocol
    Chain,
    /// Satellite state snapshot protocol
    Snapshot,
    /// Unknown protocol
    Unknown,
}

/// Get the protocol type from a protocol name
pub fn protocol_type(name: &str) -> ProtocolType {
    match name {
        CHAIN_PROTOCOL => ProtocolType::Chain,
        SNAP_PROTOCOL => ProtocolType::Snapshot,
        _ => ProtocolType::Unknown,
    }
}

/// Capabilities advertised by the local node
pub fn local_capabilities(snap_enabled: bool) -> Vec<Capability> {
    let mut caps: Vec<Capability> = CHAIN_VERSIONS.iter().map(|v| Capability::chain(*v)).collect();
    if snap_enabled {
        caps.extend(SNAP_VERSIONS.iter().map(|v| Capability::snap(*v)));
    }
    caps
}

/// Check whether a capability list contains any version of a protocol
pub fn supports(caps: &[Capability], name: &str) -> bool {
    caps.iter().any(|cap| cap.name == name)
}

/// Negotiate the highest version of `name` that both sides support
pub fn negotiate(local: &[Capability], remote: &[Capability], name: &str) -> Option<Capability> {
    local
        .iter()
        .filter(|cap| cap.name == name && remote.contains(cap))
        .max_by_key(|cap| cap.version)
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_type() {
        assert_eq!(protocol_type(CHAIN_PROTOCOL), ProtocolType::Chain);
        assert_eq!(protocol_type(SNAP_PROTOCOL), ProtocolType::Snapshot);
        assert_eq!(protocol_type("/unknown/protocol"), ProtocolType::Unknown);
    }

    #[test]
    fn test_local_capabilities() {
        let with_snap = local_capabilities(true);
        assert!(supports(&with_snap, CHAIN_PROTOCOL));
        assert!(supports(&with_snap, SNAP_PROTOCOL));

        let without_snap = local_capabilities(false);
        assert!(supports(&without_snap, CHAIN_PROTOCOL));
        assert!(!supports(&without_snap, SNAP_PROTOCOL));
    }

    #[test]
    fn test_negotiate_picks_highest_common_version() {
        let local = vec![Capability::chain(67), Capability::chain(66), Capability::snap(1)];

        let remote = vec![Capability::chain(66), Capability::chain(67)];
        assert_eq!(negotiate(&local, &remote, CHAIN_PROTOCOL), Some(Capability::chain(67)));

        // Remote only speaks the older version
        let remote = vec![Capability::chain(66)];
        assert_eq!(negotiate(&local, &remote, CHAIN_PROTOCOL), Some(Capability::chain(66)));

        // No satellite on the remote side
        assert_eq!(negotiate(&local, &remote, SNAP_PROTOCOL), None);

        // Remote is too new
        let remote = vec![Capability::chain(68)];
        assert_eq!(negotiate(&local, &remote, CHAIN_PROTOCOL), None);
    }

    #[test]
    fn test_capability_display() {
        assert_eq!(Capability::snap(1).to_string(), "snap/1");
    }
}
