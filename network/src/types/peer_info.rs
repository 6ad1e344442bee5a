use serde::{Deserialize, Serialize};
use tl_proto::{TlRead, TlWrite};

use crate::types::{Address, PeerId};

/// Peer id with its known listen addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TlRead, TlWrite)]
pub struct PeerInfo {
    pub id: PeerId,
    #[tl(with = "tl_address_list")]
    pub addresses: Vec<Address>,
}

impl PeerInfo {
    pub const MAX_ADDRESSES: usize = 8;

    pub fn new(id: PeerId, addresses: Vec<Address>) -> Self {
        Self { id, addresses }
    }

    pub fn without_addresses(id: PeerId) -> Self {
        Self {
            id,
            addresses: Vec::new(),
        }
    }
}

mod tl_address_list {
    use tl_proto::{TlError, TlPacket, TlRead, TlResult, TlWrite};

    use super::*;

    pub fn size_hint(addresses: &[Address]) -> usize {
        4 + addresses.iter().map(Address::max_size_hint).sum::<usize>()
    }

    pub fn write<P: TlPacket>(addresses: &[Address], packet: &mut P) {
        addresses.write_to(packet);
    }

    pub fn read(packet: &mut &[u8]) -> TlResult<Vec<Address>> {
        let len = u32::read_from(packet)? as usize;
        if len > PeerInfo::MAX_ADDRESSES {
            return Err(TlError::InvalidData);
        }

        let mut items = Vec::with_capacity(len);
        for _ in 0..len {
            items.push(Address::read_from(packet)?);
        }
        Ok(items)
    }
}
