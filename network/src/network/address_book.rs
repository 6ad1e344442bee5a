use std::sync::Arc;

use cairn_util::FastDashMap;

use crate::types::{Address, PeerId, PeerInfo};

/// Known dialable addresses of remote peers.
#[derive(Default, Clone)]
#[repr(transparent)]
pub struct AddressBook(Arc<FastDashMap<PeerId, Vec<Address>>>);

impl AddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn addresses(&self, peer_id: &PeerId) -> Vec<Address> {
        self.0
            .get(peer_id)
            .map(|item| item.value().clone())
            .unwrap_or_default()
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.0.contains_key(peer_id)
    }

    /// Merges addresses into the entry. The newest ones come first.
    pub fn add<I>(&self, peer_id: &PeerId, addresses: I)
    where
        I: IntoIterator<Item = Address>,
    {
        let mut entry = self.0.entry(*peer_id).or_default();
        for address in addresses {
            entry.retain(|item| item != &address);
            entry.insert(0, address);
        }
        entry.truncate(PeerInfo::MAX_ADDRESSES);
    }

    pub fn add_peer_info(&self, peer_info: &PeerInfo) {
        if !peer_info.addresses.is_empty() {
            self.add(&peer_info.id, peer_info.addresses.iter().copied());
        }
    }

    /// Returns a peer info with all known addresses of the peer.
    pub fn peer_info(&self, peer_id: &PeerId) -> PeerInfo {
        PeerInfo::new(*peer_id, self.addresses(peer_id))
    }

    pub fn remove(&self, peer_id: &PeerId) {
        self.0.remove(peer_id);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_are_deduplicated_and_capped() {
        let book = AddressBook::new();
        let peer_id = PeerId::random();

        let first = Address::from((std::net::Ipv4Addr::LOCALHOST, 1000));
        book.add(&peer_id, [first, first]);
        assert_eq!(book.addresses(&peer_id), vec![first]);

        book.add(&peer_id, (0..20).map(|port| Address::from((std::net::Ipv4Addr::LOCALHOST, 2000 + port))));
        let addresses = book.addresses(&peer_id);
        assert_eq!(addresses.len(), PeerInfo::MAX_ADDRESSES);
        assert_eq!(addresses[0], Address::from((std::net::Ipv4Addr::LOCALHOST, 2019)));
        assert!(!addresses.contains(&first));
    }
}
