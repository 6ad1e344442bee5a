use tl_proto::{TlRead, TlWrite};

use crate::types::PeerInfo;

/// Negotiated protocol id of the identify service.
pub const PROTOCOL_ID: &str = "/ipfs/id/1.0.0";

/// A response for the [`rpc::Identify`] query.
#[derive(Debug, Clone, TlRead, TlWrite)]
#[tl(boxed, id = 0x5e2d90b4)]
pub struct IdentifyResponse {
    /// Responder id and its listen addresses.
    pub info: PeerInfo,
}

pub mod rpc {
    use super::*;

    /// Query for the peer info of the responder.
    #[derive(Debug, Clone, TlRead, TlWrite)]
    #[tl(boxed, id = 0xc41a7d3f)]
    pub struct Identify;
}
