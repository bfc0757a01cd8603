//! Pairing of snapshot connections with their primary chain connection.
//!
//! Both connections of a peer arrive independently and in any order. Each
//! identity gets one slot; the chain session claims it, the snap session
//! offers into it. A slot lives as long as the chain session that owns it.

use crate::peer::SatellitePeer;
use crate::{NetworkError, PeerId, short_id};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::debug;

enum Slot {
    /// Satellite arrived first and waits for its primary.
    Parked(SatellitePeer),
    /// Primary is waiting for its satellite.
    Waiting(oneshot::Sender<SatellitePeer>),
    /// Satellite delivered to the primary.
    Paired,
    /// Primary gave up waiting; late satellites are refused.
    Retired,
}

#[derive(Default)]
pub struct SatelliteRendezvous {
    slots: Mutex<HashMap<PeerId, Slot>>,
}

impl SatelliteRendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the slot for a primary session.
    ///
    /// Fails with `DuplicateIdentity` while another primary session for the
    /// same identity still owns its slot.
    pub fn claim(self: &Arc<Self>, id: PeerId) -> Result<PairingSlot, NetworkError> {
        let mut slots = self.slots.lock();
        let state = match slots.remove(&id) {
            None => {
                let (tx, rx) = oneshot::channel();
                slots.insert(id, Slot::Waiting(tx));
                SlotState::Pending(rx)
            }
            Some(Slot::Parked(satellite)) => {
                slots.insert(id, Slot::Paired);
                SlotState::Ready(Some(satellite))
            }
            Some(live) => {
                slots.insert(id, live);
                return Err(NetworkError::DuplicateIdentity(id));
            }
        };
        Ok(PairingSlot {
            id,
            rendezvous: self.clone(),
            state,
        })
    }

    /// Hands a satellite to its primary, or parks it if the primary has not
    /// arrived yet.
    ///
    /// Fails with `PairingRejected` when the primary already gave up or
    /// already has a satellite.
    pub fn offer(self: &Arc<Self>, satellite: SatellitePeer) -> Result<SatelliteOffer, NetworkError> {
        let id = *satellite.id();
        let mut slots = self.slots.lock();
        match slots.remove(&id) {
            None => {
                slots.insert(id, Slot::Parked(satellite));
                debug!(peer = %short_id(&id), "satellite parked");
            }
            Some(Slot::Waiting(tx)) => {
                if tx.send(satellite).is_err() {
                    slots.insert(id, Slot::Retired);
                    return Err(NetworkError::PairingRejected(id));
                }
                slots.insert(id, Slot::Paired);
                debug!(peer = %short_id(&id), "satellite delivered");
            }
            Some(live) => {
                slots.insert(id, live);
                return Err(NetworkError::PairingRejected(id));
            }
        }
        Ok(SatelliteOffer {
            id,
            rendezvous: self.clone(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    fn retire(&self, id: &PeerId, rx: &mut oneshot::Receiver<SatellitePeer>) -> Option<SatellitePeer> {
        let mut slots = self.slots.lock();
        // The satellite may have been delivered between the timeout firing
        // and taking the lock.
        if let Ok(satellite) = rx.try_recv() {
            return Some(satellite);
        }
        slots.insert(*id, Slot::Retired);
        None
    }
}

enum SlotState {
    Pending(oneshot::Receiver<SatellitePeer>),
    Ready(Option<SatellitePeer>),
    Done,
}

/// Slot owned by a primary session. Dropping it removes the slot.
pub struct PairingSlot {
    id: PeerId,
    rendezvous: Arc<SatelliteRendezvous>,
    state: SlotState,
}

impl PairingSlot {
    /// Waits up to `limit` for the satellite. Returns `None` on timeout,
    /// after which late satellites are refused.
    pub async fn wait(&mut self, limit: Duration) -> Option<SatellitePeer> {
        match std::mem::replace(&mut self.state, SlotState::Done) {
            SlotState::Ready(satellite) => satellite,
            SlotState::Done => None,
            SlotState::Pending(mut rx) => match timeout(limit, &mut rx).await {
                Ok(Ok(satellite)) => Some(satellite),
                Ok(Err(_)) => None,
                Err(_) => {
                    let satellite = self.rendezvous.retire(&self.id, &mut rx);
                    if satellite.is_none() {
                        debug!(peer = %short_id(&self.id), "no satellite within pairing timeout");
                    }
                    satellite
                }
            },
        }
    }
}

impl Drop for PairingSlot {
    fn drop(&mut self) {
        self.rendezvous.slots.lock().remove(&self.id);
    }
}

/// Held by a satellite session. Dropping it withdraws a satellite that is
/// still parked; a delivered satellite stays with its primary.
pub struct SatelliteOffer {
    id: PeerId,
    rendezvous: Arc<SatelliteRendezvous>,
}

impl Drop for SatelliteOffer {
    fn drop(&mut self) {
        let mut slots = self.rendezvous.slots.lock();
        if matches!(slots.get(&self.id), Some(Slot::Parked(_))) {
            slots.remove(&self.id);
        }
    }
}
