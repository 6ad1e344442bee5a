use bytes::Bytes;
use tl_proto::{TlRead, TlWrite};

use crate::types::{PeerId, PeerInfo};

/// Negotiated protocol id of the DHT.
pub const PROTOCOL_ID: &str = "/ipfs/kad/1.0.0";

/// A key-value record.
#[derive(Debug, Clone, PartialEq, Eq, TlRead, TlWrite)]
#[tl(boxed, id = 0x4c8a6f21)]
pub struct Record {
    pub key: Bytes,
    pub value: Bytes,
    /// Unix timestamp when the record was received by the storing peer.
    pub received_at: u32,
}

/// A response for the [`rpc::FindNode`] query.
#[derive(Debug, Clone, TlRead, TlWrite)]
#[tl(boxed, id = 0x1e7c0b5d)]
pub struct NodeResponse {
    /// Peers closest to the key known to the responder.
    pub closer_peers: Vec<PeerInfo>,
}

/// A response for the [`rpc::GetProviders`] query.
#[derive(Debug, Clone, TlRead, TlWrite)]
#[tl(boxed, id = 0x9a3f52c8)]
pub struct ProvidersResponse {
    /// Peers which advertised that they hold the content.
    pub providers: Vec<PeerInfo>,
    /// Peers closest to the key known to the responder.
    pub closer_peers: Vec<PeerInfo>,
}

/// A response for the [`rpc::GetValue`] query.
#[derive(Debug, Clone, TlRead, TlWrite)]
#[tl(boxed)]
pub enum ValueResponse {
    /// The record stored for the key.
    #[tl(id = 0x6b01e4a7)]
    Found(ValueFound),
    /// Peers closest to the key known to the responder.
    #[tl(id = 0x2fd85c13)]
    NotFound(Vec<PeerInfo>),
}

#[derive(Debug, Clone, TlRead, TlWrite)]
pub struct ValueFound {
    pub record: Record,
    pub closer_peers: Vec<PeerInfo>,
}

/// Value format of the `/ipns/` namespace.
#[derive(Debug, Clone, PartialEq, Eq, TlRead, TlWrite)]
#[tl(boxed, id = 0xd4e0b7a2)]
pub struct SignedValue {
    /// Owner public key.
    pub owner: PeerId,
    /// Monotonic version, higher is newer.
    pub seq: u64,
    /// Unix timestamp up to which the value is valid.
    pub expires_at: u32,
    /// Any data.
    pub data: Bytes,
    /// A `ed25519` signature of [`SignedValueToSign`].
    pub signature: Bytes,
}

/// The signed part of [`SignedValue`].
#[derive(Debug, Clone, TlWrite)]
#[tl(boxed, id = 0x57f1c93e)]
pub struct SignedValueToSign<'tl> {
    pub owner: &'tl PeerId,
    pub seq: u64,
    pub expires_at: u32,
    pub data: &'tl [u8],
}

/// DHT RPC models.
pub mod rpc {
    use super::*;

    /// Query for the peers closest to the key.
    #[derive(Debug, Clone, TlRead, TlWrite)]
    #[tl(boxed, id = 0x8b1f4e02)]
    pub struct FindNode {
        pub key: Bytes,
    }

    /// Query for the providers of the key.
    #[derive(Debug, Clone, TlRead, TlWrite)]
    #[tl(boxed, id = 0x3c99d7a4)]
    pub struct GetProviders {
        pub key: Bytes,
    }

    /// Provider advertisement. Never answered.
    #[derive(Debug, Clone, TlRead, TlWrite)]
    #[tl(boxed, id = 0xe05a6b19)]
    pub struct AddProvider {
        pub key: Bytes,
        pub provider: PeerInfo,
    }

    /// Query for the record stored for the key.
    #[derive(Debug, Clone, TlRead, TlWrite)]
    #[tl(boxed, id = 0x71c3f8d6)]
    pub struct GetValue {
        pub key: Bytes,
    }

    /// Store a record. Answered with the record kept by the peer.
    #[derive(Debug, Clone, TlRead, TlWrite)]
    #[tl(boxed, id = 0xa9264e5b)]
    pub struct PutValue {
        pub record: Record,
    }
}
