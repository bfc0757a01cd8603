use crate::p2p::WireMessage;
use crate::peer::Peer;
use crate::{NetworkError, PeerId, short_id};
use parking_lot::RwLock;
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, trace};

struct Entry {
    peer: Arc<Peer>,
    seq: u64,
}

struct Inner {
    peers: HashMap<PeerId, Entry>,
    next_seq: u64,
}

/// Set of live, handshaken peers keyed by identity.
///
/// Readers never observe a half-registered peer: an entry is inserted fully
/// formed under the write lock. Every insertion or removal bumps a change
/// counter that listeners can await through [`PeerRegistry::subscribe`].
pub struct PeerRegistry {
    inner: RwLock<Inner>,
    max_peers: Option<usize>,
    changes: watch::Sender<u64>,
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

impl PeerRegistry {
    pub fn new(max_peers: Option<usize>) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: RwLock::new(Inner {
                peers: HashMap::new(),
                next_seq: 0,
            }),
            max_peers,
            changes,
        }
    }

    pub fn register(&self, peer: Arc<Peer>) -> Result<(), NetworkError> {
        let id = *peer.id();
        {
            let mut inner = self.inner.write();
            if inner.peers.contains_key(&id) {
                return Err(NetworkError::DuplicateIdentity(id));
            }
            if let Some(limit) = self.max_peers
                && inner.peers.len() >= limit
            {
                return Err(NetworkError::TooManyPeers(limit));
            }
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.peers.insert(id, Entry { peer, seq });
        }
        debug!(peer = %short_id(&id), "peer registered");
        self.changes.send_modify(|n| *n += 1);
        Ok(())
    }

    /// Removes a peer. Removing an absent identity is a no-op.
    pub fn unregister(&self, id: &PeerId) -> Option<Arc<Peer>> {
        let removed = self.inner.write().peers.remove(id).map(|entry| entry.peer);
        if removed.is_some() {
            debug!(peer = %short_id(id), "peer unregistered");
            self.changes.send_modify(|n| *n += 1);
        }
        removed
    }

    /// Peer with the greatest advertised weight, ties going to the peer
    /// registered first.
    pub fn peer_with_highest_weight(&self, excluding: &HashSet<PeerId>) -> Option<Arc<Peer>> {
        let inner = self.inner.read();
        inner
            .peers
            .iter()
            .filter(|(id, _)| !excluding.contains(*id))
            .max_by_key(|(_, entry)| (entry.peer.weight(), Reverse(entry.seq)))
            .map(|(_, entry)| entry.peer.clone())
    }

    /// Point-in-time copy of all peers, in registration order.
    pub fn snapshot(&self) -> Vec<Arc<Peer>> {
        let inner = self.inner.read();
        let mut entries: Vec<(u64, Arc<Peer>)> = inner
            .peers
            .values()
            .map(|entry| (entry.seq, entry.peer.clone()))
            .collect();
        drop(inner);
        entries.sort_unstable_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, peer)| peer).collect()
    }

    pub fn peer(&self, id: &PeerId) -> Option<Arc<Peer>> {
        self.inner.read().peers.get(id).map(|entry| entry.peer.clone())
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.inner.read().peers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().peers.is_empty()
    }

    pub fn satellite_count(&self) -> usize {
        self.inner
            .read()
            .peers
            .values()
            .filter(|entry| entry.peer.satellite().is_some())
            .count()
    }

    /// Queues `msg` on every peer without blocking. Returns how many peers
    /// accepted it.
    pub fn broadcast(&self, msg: &WireMessage) -> usize {
        let mut delivered = 0;
        for peer in self.snapshot() {
            match peer.try_send(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(err) => trace!(peer = %short_id(peer.id()), %err, "broadcast skipped"),
            }
        }
        delivered
    }

    /// Receiver that is marked changed on every insertion or removal.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }
}
