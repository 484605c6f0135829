//! Peer state and the registry the broadcast loop owns exclusively.
//!
//! Grounded on `crates/agent/src/peer.rs`'s atomic-state + swap-on-reconnect
//! pattern, simplified: this spec has no reconnect-with-a-fresh-offer path
//! (CLOSED is terminal, I4), so there is no generation counter to track.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use bytes::Bytes;
use tokio::sync::mpsc;

pub type PeerId = u64;

/// Liveness state, written by WebRTC connection-state callbacks and read by
/// the broadcast loop. A single machine-word atomic — spec.md §9 explicitly
/// asks that this not become a mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Disconnected,
    Connected,
    Closed,
}

impl PeerState {
    fn to_u8(self) -> u8 {
        match self {
            PeerState::Disconnected => 0,
            PeerState::Connected => 1,
            PeerState::Closed => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => PeerState::Disconnected,
            1 => PeerState::Connected,
            _ => PeerState::Closed,
        }
    }
}

/// One connected listener (spec.md §3 `Peer`). Owned by the broadcast
/// registry once it reaches CONNECTED; shared with the per-peer sender task
/// (which holds the receiving half of `frame_tx`) and the WebRTC
/// connection-state callback (which writes `state`).
pub struct Peer {
    state: AtomicU8,
    frame_tx: mpsc::Sender<Bytes>,
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl Peer {
    pub fn new(frame_tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            state: AtomicU8::new(PeerState::Disconnected.to_u8()),
            frame_tx,
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> PeerState {
        PeerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: PeerState) {
        self.state.store(state.to_u8(), Ordering::Release);
    }

    /// Non-blocking enqueue. Returns whether the frame was accepted.
    /// Every call increments exactly one of `sent`/`dropped` (I2).
    pub fn try_enqueue(&self, frame: Bytes) -> bool {
        match self.frame_tx.try_send(frame) {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// id → Peer. Owned exclusively by the broadcast loop (spec.md §3 `PeerRegistry`,
/// invariant I1/I3). Everything else crosses the boundary through the
/// rendezvous channel in `crate::broadcast`.
pub struct PeerRegistry {
    peers: HashMap<PeerId, Arc<Peer>>,
    next_id: PeerId,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Assign the next identifier and register the peer. Identifiers are
    /// strictly increasing and never reused (I5).
    pub fn insert(&mut self, peer: Arc<Peer>) -> PeerId {
        let id = self.next_id;
        self.next_id += 1;
        self.peers.insert(id, peer);
        id
    }

    pub fn remove(&mut self, id: PeerId) -> Option<Arc<Peer>> {
        self.peers.remove(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PeerId, &Arc<Peer>)> {
        self.peers.iter()
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotone_and_never_reused() {
        let mut reg = PeerRegistry::new();
        let (tx, _rx) = mpsc::channel(1);
        let a = reg.insert(Arc::new(Peer::new(tx.clone())));
        let b = reg.insert(Arc::new(Peer::new(tx.clone())));
        reg.remove(a);
        let c = reg.insert(Arc::new(Peer::new(tx)));
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(c, 3);
        assert_ne!(c, a);
    }

    #[test]
    fn enqueue_counts_exactly_one_of_sent_or_dropped() {
        let (tx, mut rx) = mpsc::channel(2);
        let peer = Peer::new(tx);

        assert!(peer.try_enqueue(Bytes::from_static(b"a")));
        assert!(peer.try_enqueue(Bytes::from_static(b"b")));
        assert_eq!(peer.sent(), 2);
        assert_eq!(peer.dropped(), 0);

        // Queue is full now (capacity 2, nothing drained yet).
        assert!(!peer.try_enqueue(Bytes::from_static(b"c")));
        assert_eq!(peer.sent(), 2);
        assert_eq!(peer.dropped(), 1);

        rx.try_recv().unwrap();
        assert!(peer.try_enqueue(Bytes::from_static(b"d")));
        assert_eq!(peer.sent(), 3);
    }

    #[test]
    fn state_round_trips() {
        let (tx, _rx) = mpsc::channel(1);
        let peer = Peer::new(tx);
        assert_eq!(peer.state(), PeerState::Disconnected);
        peer.set_state(PeerState::Connected);
        assert_eq!(peer.state(), PeerState::Connected);
        peer.set_state(PeerState::Closed);
        assert_eq!(peer.state(), PeerState::Closed);
    }
}
