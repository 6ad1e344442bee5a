use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use cairn_util::FastDashMap;
use tokio::sync::broadcast;

use crate::network::connection::Connection;
use crate::types::{Direction, DisconnectReason, PeerEvent, PeerId};

/// Live connections, one per remote peer.
#[derive(Clone)]
pub struct ActivePeers(Arc<ActivePeersInner>);

impl ActivePeers {
    pub fn new(channel_size: usize) -> Self {
        Self(Arc::new(ActivePeersInner::new(channel_size)))
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<Connection> {
        self.0.get(peer_id)
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.0.contains(peer_id)
    }

    /// Registers the connection. Returns `None` if it lost the
    /// simultaneous dial tie-break and was closed.
    pub fn add(&self, local_id: &PeerId, new_connection: Connection) -> Option<Connection> {
        self.0.add(local_id, new_connection)
    }

    pub fn remove(&self, peer_id: &PeerId, reason: DisconnectReason) {
        self.0.remove(peer_id, reason);
    }

    pub fn remove_with_stable_id(
        &self,
        peer_id: &PeerId,
        stable_id: usize,
        reason: DisconnectReason,
    ) {
        self.0.remove_with_stable_id(peer_id, stable_id, reason);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.0.subscribe()
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.0.connections.iter().map(|item| *item.key()).collect()
    }

    pub fn clear(&self, reason: DisconnectReason) {
        for peer_id in self.peers() {
            self.remove(&peer_id, reason);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn downgrade(this: &Self) -> WeakActivePeers {
        WeakActivePeers(Arc::downgrade(&this.0))
    }
}

#[derive(Clone)]
pub struct WeakActivePeers(Weak<ActivePeersInner>);

impl WeakActivePeers {
    pub fn upgrade(&self) -> Option<ActivePeers> {
        self.0.upgrade().map(ActivePeers)
    }
}

struct ActivePeersInner {
    connections: FastDashMap<PeerId, Connection>,
    connections_len: AtomicUsize,
    events_tx: broadcast::Sender<PeerEvent>,
}

impl ActivePeersInner {
    fn new(channel_size: usize) -> Self {
        let (events_tx, _) = broadcast::channel(channel_size);
        Self {
            connections: Default::default(),
            connections_len: Default::default(),
            events_tx,
        }
    }

    fn get(&self, peer_id: &PeerId) -> Option<Connection> {
        self.connections
            .get(peer_id)
            .map(|item| item.value().clone())
    }

    fn contains(&self, peer_id: &PeerId) -> bool {
        self.connections.contains_key(peer_id)
    }

    #[must_use]
    fn add(&self, local_id: &PeerId, new_connection: Connection) -> Option<Connection> {
        use dashmap::mapref::entry::Entry;

        let remote_id = *new_connection.peer_id();
        match self.connections.entry(remote_id) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_closed()
                    || simultaneous_dial_tie_breaking(
                        local_id,
                        &remote_id,
                        entry.get().origin(),
                        new_connection.origin(),
                    )
                {
                    tracing::debug!(%remote_id, "replacing an existing connection");
                    let old_connection = entry.insert(new_connection.clone());
                    old_connection.close();
                    self.send_event(PeerEvent::LostPeer(remote_id, DisconnectReason::Replaced));
                } else {
                    tracing::debug!(%remote_id, "closing new connection to mitigate simultaneous dial");
                    new_connection.close();
                    return None;
                }
            }
            Entry::Vacant(entry) => {
                self.connections_len.fetch_add(1, Ordering::Release);
                entry.insert(new_connection.clone());
            }
        }

        self.send_event(PeerEvent::NewPeer(remote_id));
        Some(new_connection)
    }

    fn remove(&self, peer_id: &PeerId, reason: DisconnectReason) {
        if let Some((_, connection)) = self.connections.remove(peer_id) {
            connection.close();
            self.connections_len.fetch_sub(1, Ordering::Release);
            self.send_event(PeerEvent::LostPeer(*peer_id, reason));
        }
    }

    fn remove_with_stable_id(&self, peer_id: &PeerId, stable_id: usize, reason: DisconnectReason) {
        if let Some((_, connection)) = self
            .connections
            .remove_if(peer_id, |_, connection| connection.stable_id() == stable_id)
        {
            connection.close();
            self.connections_len.fetch_sub(1, Ordering::Release);
            self.send_event(PeerEvent::LostPeer(*peer_id, reason));
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events_tx.subscribe()
    }

    fn send_event(&self, event: PeerEvent) {
        _ = self.events_tx.send(event);
    }

    fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    fn len(&self) -> usize {
        self.connections_len.load(Ordering::Acquire)
    }
}

/// Both sides must keep the same connection when they dial each other
/// at the same time: the one dialed by the peer with the smaller id wins.
fn simultaneous_dial_tie_breaking(
    local_id: &PeerId,
    remote_id: &PeerId,
    old_origin: Direction,
    new_origin: Direction,
) -> bool {
    match (old_origin, new_origin) {
        (Direction::Inbound, Direction::Inbound) | (Direction::Outbound, Direction::Outbound) => {
            true
        }
        (Direction::Inbound, Direction::Outbound) => remote_id < local_id,
        (Direction::Outbound, Direction::Inbound) => local_id < remote_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tie_breaking_is_symmetric() {
        let a = PeerId([1; 32]);
        let b = PeerId([2; 32]);

        // On `a`: old outbound to `b`, new inbound from `b`.
        let a_replaces = simultaneous_dial_tie_breaking(&a, &b, Direction::Outbound, Direction::Inbound);
        // On `b`: old outbound to `a`, new inbound from `a`.
        let b_replaces = simultaneous_dial_tie_breaking(&b, &a, Direction::Outbound, Direction::Inbound);

        // Exactly one side keeps its outbound connection,
        // and both end up with the connection dialed by `a`.
        assert_ne!(a_replaces, b_replaces);
        assert!(!a_replaces);
        assert!(b_replaces);
    }
}
