use std::sync::Arc;

use cairn_util::FastHashMap;

use crate::types::{Distance, Key, PeerId, PeerInfo};

/// State of a peer within a single lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerState {
    /// Learned about but not contacted yet.
    Heard,
    /// A request is in flight.
    Waiting,
    /// Answered successfully.
    Queried,
    /// Failed to answer.
    Unreachable,
}

impl PeerState {
    fn can_become(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Heard, Self::Waiting)
                | (Self::Waiting, Self::Queried)
                | (Self::Waiting, Self::Unreachable)
        )
    }
}

struct QueryPeer {
    info: Arc<PeerInfo>,
    distance: Distance,
    state: PeerState,
}

/// All peers touched by a single lookup.
pub(crate) struct QueryPeerSet {
    target: Key,
    peers: FastHashMap<PeerId, QueryPeer>,
}

impl QueryPeerSet {
    pub fn new(target: Key) -> Self {
        Self {
            target,
            peers: Default::default(),
        }
    }

    /// Adds the peer in the [`PeerState::Heard`] state if it was not seen before.
    pub fn try_add(&mut self, info: Arc<PeerInfo>) -> bool {
        use std::collections::hash_map::Entry;

        match self.peers.entry(info.id) {
            Entry::Vacant(entry) => {
                let distance = self.target.distance(&Key::from_peer_id(&info.id));
                entry.insert(QueryPeer {
                    info,
                    distance,
                    state: PeerState::Heard,
                });
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    pub fn state(&self, peer_id: &PeerId) -> Option<PeerState> {
        self.peers.get(peer_id).map(|peer| peer.state)
    }

    /// # Panics
    ///
    /// Panics on an unknown peer or an illegal transition.
    pub fn set_state(&mut self, peer_id: &PeerId, state: PeerState) {
        let Some(peer) = self.peers.get_mut(peer_id) else {
            panic!("BUG: peer {peer_id} is not a part of the lookup");
        };
        assert!(
            peer.state.can_become(state),
            "BUG: illegal peer state transition {:?} -> {state:?} for {peer_id}",
            peer.state,
        );
        peer.state = state;
    }

    pub fn num_in_state(&self, state: PeerState) -> usize {
        self.peers.values().filter(|peer| peer.state == state).count()
    }

    pub fn num_waiting(&self) -> usize {
        self.num_in_state(PeerState::Waiting)
    }

    pub fn num_heard(&self) -> usize {
        self.num_in_state(PeerState::Heard)
    }

    /// Up to `count` peers in any of the `states`, closest to the target first.
    pub fn closest_in_states(
        &self,
        states: &[PeerState],
        count: usize,
    ) -> Vec<(Arc<PeerInfo>, PeerState)> {
        let mut peers = self
            .peers
            .values()
            .filter(|peer| states.contains(&peer.state))
            .collect::<Vec<_>>();
        peers.sort_by(|a, b| a.distance.cmp(&b.distance));
        peers
            .into_iter()
            .take(count)
            .map(|peer| (peer.info.clone(), peer.state))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }
}

/// Sorts peers by distance to the target key.
///
/// The order does not depend on the initial order of the peers.
pub fn sort_by_distance(target: &Key, peers: &mut [PeerId]) {
    peers.sort_by_cached_key(|peer_id| (target.distance(&Key::from_peer_id(peer_id)), *peer_id));
}
