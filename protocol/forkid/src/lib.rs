//! Fork identifiers.
//!
//! A fork identifier summarises which rule upgrades a chain has already
//! activated and which one it expects next. Peers exchange it during the
//! status handshake and advertise it on the discovery network so that nodes
//! on incompatible upgrade schedules can be filtered out before any chain
//! data is exchanged.
//!
//! The checksum is the first four bytes of SHA-256 over the genesis hash
//! followed by the big-endian height of every passed upgrade, in ascending
//! order.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

mod entry;

pub use entry::{ENTRY_KEY, EntryError, ForkEntry};

/// A named rule upgrade activated at a block height.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upgrade {
    pub name: String,
    pub height: u64,
}

impl Upgrade {
    pub fn new(name: impl Into<String>, height: u64) -> Self {
        Self {
            name: name.into(),
            height,
        }
    }
}

/// The upgrade schedule of a chain configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ForkSchedule {
    upgrades: Vec<Upgrade>,
}

impl ForkSchedule {
    pub fn new<I>(upgrades: I) -> Self
    where
        I: IntoIterator<Item = Upgrade>,
    {
        let mut upgrades: Vec<Upgrade> = upgrades.into_iter().collect();
        upgrades.sort_by_key(|upgrade| upgrade.height);
        Self { upgrades }
    }

    pub fn from_heights<I>(heights: I) -> Self
    where
        I: IntoIterator<Item = u64>,
    {
        Self::new(
            heights
                .into_iter()
                .enumerate()
                .map(|(i, height)| Upgrade::new(format!("upgrade-{i}"), height)),
        )
    }

    pub fn upgrades(&self) -> &[Upgrade] {
        &self.upgrades
    }

    /// Distinct upgrade heights in ascending order. Upgrades active from
    /// genesis are folded into the genesis hash and do not count.
    pub fn heights(&self) -> Vec<u64> {
        let mut heights: Vec<u64> = self
            .upgrades
            .iter()
            .map(|upgrade| upgrade.height)
            .filter(|height| *height > 0)
            .collect();
        heights.sort_unstable();
        heights.dedup();
        heights
    }

    pub fn active_at(&self, height: u64) -> impl Iterator<Item = &Upgrade> {
        self.upgrades
            .iter()
            .filter(move |upgrade| upgrade.height <= height)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForkId {
    /// Checksum of the genesis hash and all passed upgrade heights.
    pub hash: [u8; 4],
    /// Height of the next scheduled upgrade, 0 if none is known.
    pub next: u64,
}

impl ForkId {
    pub fn new(schedule: &ForkSchedule, genesis: &[u8; 32], head: u64) -> Self {
        let mut checksum = Checksum::new(genesis);
        for height in schedule.heights() {
            if height > head {
                return Self {
                    hash: checksum.digest(),
                    next: height,
                };
            }
            checksum.absorb(height);
        }
        Self {
            hash: checksum.digest(),
            next: 0,
        }
    }
}

impl fmt::Display for ForkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.hash {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "/{}", self.next)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ForkIdError {
    #[error("remote fork id is stale: remote has not applied a locally known upgrade")]
    RemoteStale,
    #[error("local chain is incompatible with or stale relative to the remote fork id")]
    LocalIncompatibleOrStale,
}

#[derive(Clone)]
struct Checksum(Sha256);

impl Checksum {
    fn new(genesis: &[u8; 32]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(genesis);
        Self(hasher)
    }

    fn absorb(&mut self, height: u64) {
        self.0.update(height.to_be_bytes());
    }

    fn digest(&self) -> [u8; 4] {
        let digest = self.0.clone().finalize();
        let mut out = [0u8; 4];
        out.copy_from_slice(&digest[..4]);
        out
    }
}

/// Validates remote fork identifiers against the local schedule.
#[derive(Clone, Debug)]
pub struct ForkFilter {
    /// Upgrade heights with a trailing `u64::MAX` sentinel.
    forks: Vec<u64>,
    /// `sums[i]` is the checksum after the first `i` upgrades.
    sums: Vec<[u8; 4]>,
}

impl ForkFilter {
    pub fn new(schedule: &ForkSchedule, genesis: &[u8; 32]) -> Self {
        let heights = schedule.heights();
        let mut checksum = Checksum::new(genesis);
        let mut sums = Vec::with_capacity(heights.len() + 1);
        sums.push(checksum.digest());
        for height in &heights {
            checksum.absorb(*height);
            sums.push(checksum.digest());
        }
        let mut forks = heights;
        forks.push(u64::MAX);
        Self { forks, sums }
    }

    /// Checks a remote fork id against the local schedule at `head`.
    ///
    /// Accepts when the remote is on the same upgrade set (and does not
    /// announce an upgrade the local chain has already passed without
    /// applying), when the remote is behind on a prefix of the local
    /// schedule and announces the next local upgrade, or when the remote is
    /// ahead on a superset that the local schedule already knows about.
    pub fn validate(&self, remote: ForkId, head: u64) -> Result<(), ForkIdError> {
        for (i, fork) in self.forks.iter().enumerate() {
            if head >= *fork {
                continue;
            }
            if self.sums[i] == remote.hash {
                if remote.next > 0 && head >= remote.next {
                    return Err(ForkIdError::LocalIncompatibleOrStale);
                }
                return Ok(());
            }
            for j in 0..i {
                if self.sums[j] == remote.hash {
                    if self.forks[j] != remote.next {
                        return Err(ForkIdError::RemoteStale);
                    }
                    return Ok(());
                }
            }
            if self.sums[i + 1..].contains(&remote.hash) {
                return Ok(());
            }
            return Err(ForkIdError::LocalIncompatibleOrStale);
        }
        Err(ForkIdError::LocalIncompatibleOrStale)
    }
}
