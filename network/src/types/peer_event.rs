use crate::types::PeerId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    NewPeer(PeerId),
    LostPeer(PeerId, DisconnectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Closed by the local side (eviction, reset, shutdown).
    Requested,
    /// Replaced by a newer connection to the same peer.
    Replaced,
    /// Closed by the remote side or broken.
    ConnectionClosed,
}
